// ABOUTME: Scripted transport for testing - replays pre-configured records per query.
// ABOUTME: Records every InvocationParams it receives so tests can inspect built invocations.
//!
//! # Example
//!
//! ```no_run
//! use codebridge_agent::transport::{ScriptedTransport, Transport};
//! use codebridge_agent::{InvocationParams, QueryError};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let transport = ScriptedTransport::new()
//!     .respond_with(vec![
//!         json!({"type": "system", "subtype": "init", "session_id": "T1"}),
//!         json!({"type": "result", "result": "done"}),
//!     ])
//!     .respond_then_fail(vec![], QueryError::AbnormalExit { code: 1 });
//!
//! let mut rx = transport
//!     .stream_query(InvocationParams::new("hi"), CancellationToken::new())
//!     .await
//!     .unwrap();
//! while let Some(item) = rx.recv().await {
//!     println!("{:?}", item);
//! }
//! # }
//! ```

use super::Transport;
use crate::bridge::{record_channel, RecordReceiver};
use crate::error::QueryError;
use crate::invocation::InvocationParams;
use crate::record::OutputRecord;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

enum Outcome {
    End,
    Fail(QueryError),
    FailToStart(QueryError),
}

struct Script {
    records: Vec<Value>,
    outcome: Outcome,
}

/// Transport that answers queries from a FIFO of scripts
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<InvocationParams>>,
    forgotten: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next query yields these records, then ends cleanly
    pub fn respond_with(self, records: Vec<Value>) -> Self {
        self.script(records, Outcome::End)
    }

    /// Next query yields these records, then the error
    pub fn respond_then_fail(self, records: Vec<Value>, error: QueryError) -> Self {
        self.script(records, Outcome::Fail(error))
    }

    /// Next query fails before producing anything
    pub fn fail_to_start(self, error: QueryError) -> Self {
        self.script(Vec::new(), Outcome::FailToStart(error))
    }

    /// Invocations received so far, in call order
    pub fn calls(&self) -> Vec<InvocationParams> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Tokens passed to `forget`, in call order
    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn script(self, records: Vec<Value>, outcome: Outcome) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Script { records, outcome });
        self
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn stream_query<'a>(
        &'a self,
        params: InvocationParams,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<RecordReceiver, QueryError>> {
        async move {
            let prompt = params.prompt.clone();
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(params);

            let script = self
                .scripts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_else(|| Script {
                    records: vec![serde_json::json!({
                        "type": "result",
                        "result": format!("Scripted: no script for '{}'", prompt),
                    })],
                    outcome: Outcome::End,
                });

            let (tx, rx) = record_channel();
            match script.outcome {
                Outcome::FailToStart(error) => return Err(error),
                Outcome::End => {
                    for record in script.records {
                        tx.push(OutputRecord::new(record));
                    }
                    tx.close();
                }
                Outcome::Fail(error) => {
                    for record in script.records {
                        tx.push(OutputRecord::new(record));
                    }
                    tx.fail(error);
                }
            }
            Ok(rx)
        }
        .boxed()
    }

    fn forget(&self, token: &str) {
        self.forgotten
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token.to_string());
    }
}

// ABOUTME: In-process transport - streams the Messages API over SSE, no subprocess.
// ABOUTME: Keeps conversation history per continuation token and emits CLI-shaped records.

use super::Transport;
use crate::bridge::{record_channel, RecordReceiver, RecordSender};
use crate::error::QueryError;
use crate::invocation::InvocationParams;
use crate::record::OutputRecord;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const API_VERSION: &str = "2023-06-01";

/// Explicit configuration for the in-process call. Nothing here is read
/// from or written to the process environment.
#[derive(Clone, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sent as `x-api-key`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sent as `Authorization: Bearer`, used by alternate endpoints; wins over `api_key`
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            auth_token: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

// Custom Debug impl to redact credentials
impl std::fmt::Debug for SdkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl SdkConfig {
    pub fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

type History = Arc<Mutex<HashMap<String, Vec<Value>>>>;

pub struct SdkTransport {
    config: SdkConfig,
    client: reqwest::Client,
    history: History,
}

impl SdkTransport {
    pub fn new(config: SdkConfig) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| QueryError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            client,
            history: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    /// Number of conversations held in memory
    pub fn conversation_count(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forget the history of one conversation; true if it was held
    pub fn forget_conversation(&self, token: &str) -> bool {
        let removed = self
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token)
            .is_some();
        if removed {
            tracing::debug!(session_id = %token, "Dropped conversation history");
        }
        removed
    }

    fn credential_kind(&self) -> &'static str {
        if self.config.auth_token.is_some() {
            "auth_token"
        } else if self.config.api_key.is_some() {
            "api_key"
        } else {
            "none"
        }
    }

    fn request(&self, params: &InvocationParams, messages: &[Value]) -> reqwest::RequestBuilder {
        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "stream": true,
            "messages": messages,
        });
        if let Some(ref system) = params.append_system_prompt {
            body["system"] = Value::String(system.clone());
        }

        let mut builder = self
            .client
            .post(self.config.messages_url())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(ref token) = self.config.auth_token {
            builder = builder.bearer_auth(token);
        } else if let Some(ref key) = self.config.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }
}

impl Transport for SdkTransport {
    fn name(&self) -> &'static str {
        "sdk"
    }

    fn stream_query<'a>(
        &'a self,
        params: InvocationParams,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<RecordReceiver, QueryError>> {
        async move {
            let (session_id, mut messages) = {
                let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
                match params.resume {
                    Some(ref token) => match history.get(token) {
                        Some(previous) => (token.clone(), previous.clone()),
                        None => {
                            tracing::warn!(session_id = %token, "Unknown session, starting empty history");
                            (token.clone(), Vec::new())
                        }
                    },
                    None => (uuid::Uuid::new_v4().to_string(), Vec::new()),
                }
            };
            messages.push(json!({"role": "user", "content": params.prompt}));

            if !params.mcp_servers.is_empty() || !params.allowed_tools.is_empty() {
                tracing::debug!(
                    servers = params.mcp_servers.len(),
                    allowed_tools = params.allowed_tools.len(),
                    "In-process transport does not run tools; auxiliary servers ignored"
                );
            }

            let source = EventSource::new(self.request(&params, &messages))
                .map_err(|e| QueryError::Transport(format!("failed to create event source: {}", e)))?;

            let exchange = Exchange {
                session_id,
                messages,
                model: self.config.model.clone(),
                working_dir: params
                    .working_dir
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                permission_mode: params.permission_mode.as_str(),
                resumed: params.resume.is_some(),
                credential: self.credential_kind(),
                history: Arc::clone(&self.history),
            };

            let (tx, rx) = record_channel();
            tokio::spawn(exchange.run(source, tx, cancel));
            Ok(rx)
        }
        .boxed()
    }

    fn forget(&self, token: &str) {
        self.forget_conversation(token);
    }
}

/// State of one in-flight request
struct Exchange {
    session_id: String,
    messages: Vec<Value>,
    model: String,
    working_dir: Option<String>,
    permission_mode: &'static str,
    resumed: bool,
    /// Which credential the request carried
    credential: &'static str,
    history: History,
}

impl Exchange {
    async fn run(mut self, mut source: EventSource, tx: RecordSender, cancel: CancellationToken) {
        let started = Instant::now();
        let mut text = String::new();
        let mut usage = json!({});
        let mut stop_reason = Value::Null;

        let outcome = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(session_id = %self.session_id, "Aborting in-process query");
                    break Ok(());
                }
                _ = tx.receiver_dropped() => {
                    tracing::debug!(session_id = %self.session_id, "Record receiver dropped, closing stream");
                    break Ok(());
                }
                event = source.next() => event,
            };

            match event {
                None | Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                    break Err(QueryError::Transport(
                        "stream closed before message_stop".to_string(),
                    ));
                }
                Some(Ok(Event::Open)) => {
                    tx.push(self.init_record());
                }
                Some(Ok(Event::Message(message))) => {
                    let data: Value = match serde_json::from_str(&message.data) {
                        Ok(data) => data,
                        Err(e) => {
                            tracing::debug!(error = %e, event = %message.event, "Unparseable SSE data, dropping");
                            continue;
                        }
                    };
                    match message.event.as_str() {
                        "message_start" => {
                            if let Some(u) = data.pointer("/message/usage") {
                                merge_usage(&mut usage, u);
                            }
                            if let Some(model) = data.pointer("/message/model").and_then(|m| m.as_str()) {
                                self.model = model.to_string();
                            }
                        }
                        "content_block_delta" => {
                            if data.pointer("/delta/type").and_then(|t| t.as_str()) == Some("text_delta") {
                                if let Some(delta) = data.pointer("/delta/text").and_then(|t| t.as_str()) {
                                    text.push_str(delta);
                                    tx.push(self.assistant_record(delta));
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(u) = data.get("usage") {
                                merge_usage(&mut usage, u);
                            }
                            if let Some(reason) = data.pointer("/delta/stop_reason") {
                                stop_reason = reason.clone();
                            }
                        }
                        "message_stop" => {
                            tx.push(OutputRecord::new(json!({
                                "type": "result",
                                "subtype": "success",
                                "is_error": false,
                                "result": text,
                                "session_id": self.session_id,
                                "stop_reason": stop_reason,
                                "duration_ms": started.elapsed().as_millis() as u64,
                                "usage": usage,
                            })));
                            self.remember(&text);
                            break Ok(());
                        }
                        "error" => {
                            let message = data
                                .pointer("/error/message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("Unknown error")
                                .to_string();
                            tracing::error!(
                                session_id = %self.session_id,
                                error = %message,
                                working_dir = ?self.working_dir,
                                has_session_id = self.resumed,
                                credential = self.credential,
                                "In-process stream reported an error"
                            );
                            tx.push(OutputRecord::new(json!({
                                "type": "result",
                                "subtype": "error_during_execution",
                                "is_error": true,
                                "error": message,
                                "session_id": self.session_id,
                            })));
                            break Ok(());
                        }
                        _ => {}
                    }
                }
                Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                    let body = response.text().await.unwrap_or_default();
                    break Err(QueryError::Api {
                        status: status.as_u16(),
                        message: api_error_message(&body),
                    });
                }
                Some(Err(reqwest_eventsource::Error::Transport(e))) => {
                    break Err(if e.is_connect() || e.is_timeout() {
                        QueryError::Connect(e.to_string())
                    } else {
                        QueryError::Transport(e.to_string())
                    });
                }
                Some(Err(e)) => break Err(QueryError::Transport(e.to_string())),
            }
        };

        source.close();
        match outcome {
            Ok(()) => tx.close(),
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    error = %e,
                    working_dir = ?self.working_dir,
                    has_session_id = self.resumed,
                    credential = self.credential,
                    "In-process query failed"
                );
                tx.fail(e);
            }
        }
    }

    fn init_record(&self) -> OutputRecord {
        OutputRecord::new(json!({
            "type": "system",
            "subtype": "init",
            "session_id": self.session_id,
            "model": self.model,
            "cwd": self.working_dir,
            "permissionMode": self.permission_mode,
            "tools": [],
        }))
    }

    fn assistant_record(&self, delta: &str) -> OutputRecord {
        OutputRecord::new(json!({
            "type": "assistant",
            "session_id": self.session_id,
            "message": {
                "role": "assistant",
                "model": self.model,
                "content": [{"type": "text", "text": delta}],
            },
        }))
    }

    fn remember(&mut self, reply: &str) {
        let mut messages = std::mem::take(&mut self.messages);
        messages.push(json!({"role": "assistant", "content": reply}));
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.session_id.clone(), messages);
    }
}

fn merge_usage(target: &mut Value, update: &Value) {
    if let (Some(target), Some(update)) = (target.as_object_mut(), update.as_object()) {
        for (key, value) in update {
            if !value.is_null() {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Pull `error.message` out of an API error body, falling back to the raw body
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

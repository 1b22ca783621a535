// ABOUTME: CLI transport - spawns claude with --print --output-format stream-json per query.
// ABOUTME: Delegates process lifetime to the process supervisor.

use super::Transport;
use crate::bridge::RecordReceiver;
use crate::error::QueryError;
use crate::invocation::InvocationParams;
use crate::locate::locate_cli;
use crate::process::spawn_query;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub struct CliTransport {
    binary: PathBuf,
    /// Variables added to every spawned process (e.g. alternate endpoint credentials)
    env: BTreeMap<String, String>,
}

impl CliTransport {
    /// Use exactly this executable
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            env: BTreeMap::new(),
        }
    }

    /// Resolve the executable once, from an optional configured path
    pub fn locate(configured: Option<&Path>) -> Self {
        Self::new(locate_cli(configured))
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Transport for CliTransport {
    fn name(&self) -> &'static str {
        "cli"
    }

    fn stream_query<'a>(
        &'a self,
        mut params: InvocationParams,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<RecordReceiver, QueryError>> {
        async move {
            for (key, value) in &self.env {
                params
                    .env
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            spawn_query(&self.binary, &params, cancel)
        }
        .boxed()
    }
}

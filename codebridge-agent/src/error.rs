// ABOUTME: Error taxonomy for a streaming query.
// ABOUTME: Callers match on variants to tell spawn failures from exits and transport errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Backend executable missing or not runnable; no records were produced
    #[error("Failed to spawn Claude CLI at {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Backend process exited with a non-zero code after its output was drained
    #[error("Claude CLI exited with code {code}")]
    AbnormalExit { code: i32 },

    /// The auxiliary server config file could not be written
    #[error("Failed to write MCP config: {0}")]
    McpConfig(#[source] std::io::Error),

    /// The in-process backend could not be reached
    #[error("Backend connection failed: {0}")]
    Connect(String),

    /// The in-process backend rejected the request
    #[error("Backend returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Any other in-process backend failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl QueryError {
    /// True for failures where an endpoint reachability probe helps tell
    /// "unreachable" apart from "rejected"
    pub fn should_probe(&self) -> bool {
        matches!(self, Self::AbnormalExit { .. } | Self::Connect(_))
    }

    pub fn is_abnormal_exit(&self) -> bool {
        matches!(self, Self::AbnormalExit { .. })
    }
}

// ABOUTME: Streaming query engine for coding-assistant backends.
// ABOUTME: Spawns the Claude CLI or calls the API in-process, yielding ordered output records.

pub mod bridge;
pub mod error;
pub mod framer;
pub mod invocation;
pub mod locate;
pub mod mcp;
pub mod process;
pub mod record;
pub mod transport;

pub use bridge::{record_channel, RecordReceiver, RecordSender};
pub use error::QueryError;
pub use framer::LineFramer;
pub use invocation::{InvocationParams, PermissionMode};
pub use locate::{locate_cli, DEFAULT_BINARY};
pub use mcp::{McpConfigFile, McpServerSpec, McpServers};
pub use process::{spawn_query, ProcessHandle};
pub use record::{OutputRecord, RecordKind, ToolUse, Usage};
pub use transport::{CliTransport, ScriptedTransport, SdkConfig, SdkTransport, Transport};

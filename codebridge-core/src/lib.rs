// ABOUTME: Session-aware query dispatch over coding-assistant backends
// ABOUTME: Config, session registry, MCP declarations, diagnostics and the dispatcher

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod mcp;
pub mod paths;
pub mod session;

pub use config::{BackendMode, Config, EnvDebugInfo};
pub use diagnostics::{EndpointProbe, ProbeOutcome};
pub use dispatcher::{CallerContext, QueryDispatcher, QueryRequest, QueryStream};
pub use mcp::McpManager;
pub use session::{spawn_reclaimer, Session, SessionKey, SessionRegistry};

// Re-export engine types callers match on
pub use codebridge_agent::{OutputRecord, QueryError, RecordKind, Usage};

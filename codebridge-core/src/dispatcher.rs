// ABOUTME: Query dispatcher - the single entry point from prompt to ordered output records.
// ABOUTME: Builds invocations, resumes sessions, captures the init token, probes on failure.

use crate::config::{BackendMode, Config, EnvDebugInfo, PermissionPromptConfig};
use crate::diagnostics::EndpointProbe;
use crate::mcp::McpManager;
use crate::session::Session;
use anyhow::{Context, Result};
use codebridge_agent::{
    CliTransport, InvocationParams, McpServerSpec, OutputRecord, PermissionMode, QueryError,
    RecordKind, RecordReceiver, SdkTransport, Transport,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Server name of the permission relay
pub const PERMISSION_SERVER: &str = "permission-prompt";
/// Variable carrying the serialized caller context to the permission relay
pub const CALLER_CONTEXT_ENV: &str = "SLACK_CONTEXT";

/// Who is asking. Present only for interactive chat queries, which need a
/// human to approve sensitive actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub channel: String,
    #[serde(rename = "threadTs", skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    pub user: String,
}

/// One prompt plus everything optional about it
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub prompt: String,
    pub session: Option<Session>,
    pub cancel: Option<CancellationToken>,
    pub working_dir: Option<PathBuf>,
    pub caller_context: Option<CallerContext>,
    pub append_system_prompt: Option<String>,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_caller_context(mut self, context: CallerContext) -> Self {
        self.caller_context = Some(context);
        self
    }

    pub fn with_system_prompt(mut self, text: impl Into<String>) -> Self {
        self.append_system_prompt = Some(text.into());
        self
    }
}

/// Logs failures with their context and runs the probe when it helps
#[derive(Debug, Clone)]
struct FailureReporter {
    probe: EndpointProbe,
    env_info: EnvDebugInfo,
    working_dir: Option<PathBuf>,
    resumed: bool,
}

impl FailureReporter {
    async fn report(&self, error: &QueryError) {
        tracing::error!(
            error = %error,
            working_dir = ?self.working_dir,
            has_session_id = self.resumed,
            env = ?self.env_info,
            "Error in Claude query"
        );
        if error.should_probe() {
            self.probe.probe().await;
        }
    }

    /// Error result records end the stream cleanly, so they are logged here
    fn report_record(&self, record: &OutputRecord) {
        tracing::error!(
            error = %record.error_message().unwrap_or_else(|| "unknown error".to_string()),
            session_id = ?record.session_id(),
            working_dir = ?self.working_dir,
            has_session_id = self.resumed,
            env = ?self.env_info,
            "Claude query returned an error result"
        );
    }
}

pub struct QueryDispatcher {
    transport: Arc<dyn Transport>,
    mcp: McpManager,
    permission_prompt: PermissionPromptConfig,
    probe: EndpointProbe,
    env_info: EnvDebugInfo,
}

impl QueryDispatcher {
    pub fn new(transport: Arc<dyn Transport>, mcp: McpManager) -> Self {
        Self {
            transport,
            mcp,
            permission_prompt: PermissionPromptConfig::default(),
            probe: EndpointProbe::new(None, Duration::from_secs(5)),
            env_info: Config::default().env_debug_info(),
        }
    }

    /// Pick the transport once from `config.backend.mode` and load MCP declarations
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = match config.backend.mode {
            BackendMode::Cli => {
                let transport =
                    CliTransport::locate(config.backend.cli_path.as_deref().map(Path::new))
                        .with_env(config.cli_env());
                tracing::info!(cli_path = %transport.binary().display(), "Using Claude CLI transport");
                Arc::new(transport)
            }
            BackendMode::Sdk => {
                let sdk = config.sdk_config();
                tracing::info!(base_url = %sdk.base_url, model = %sdk.model, "Using in-process transport");
                Arc::new(SdkTransport::new(sdk).context("Failed to create in-process transport")?)
            }
        };

        let mcp_path = config.mcp_servers_path();
        let mcp = McpManager::load(&mcp_path)?;

        Ok(Self::new(transport, mcp)
            .with_permission_prompt(config.permission_prompt.clone())
            .with_probe(EndpointProbe::new(
                config.backend.base_url.clone(),
                Duration::from_secs(config.diagnostics.probe_timeout_secs),
            ))
            .with_env_info(config.env_debug_info()))
    }

    pub fn with_permission_prompt(mut self, permission_prompt: PermissionPromptConfig) -> Self {
        self.permission_prompt = permission_prompt;
        self
    }

    pub fn with_probe(mut self, probe: EndpointProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_env_info(mut self, env_info: EnvDebugInfo) -> Self {
        self.env_info = env_info;
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn mcp(&self) -> &McpManager {
        &self.mcp
    }

    /// Release backend state for a session that is going away
    pub fn release(&self, session: &Session) {
        forget_session(self.transport.as_ref(), session);
    }

    /// `release` as an owned callback, for the session reclaimer
    pub fn releaser(&self) -> impl Fn(&Session) + Send + Sync + 'static {
        let transport = Arc::clone(&self.transport);
        move |session: &Session| forget_session(transport.as_ref(), session)
    }

    /// Translate a request into backend invocation parameters
    pub fn build_params(&self, request: &QueryRequest) -> InvocationParams {
        let interactive = request.caller_context.as_ref();

        let mut mcp_servers = self.mcp.servers().clone();
        if let Some(context) = interactive {
            let mut env = self.permission_prompt.env.clone();
            env.insert(
                CALLER_CONTEXT_ENV.to_string(),
                serde_json::to_string(context).unwrap_or_default(),
            );
            mcp_servers.insert(
                PERMISSION_SERVER.to_string(),
                McpServerSpec {
                    command: self.permission_prompt.command.clone(),
                    args: self.permission_prompt.args.clone(),
                    env,
                },
            );
        }

        let mut allowed_tools = Vec::new();
        if !mcp_servers.is_empty() {
            allowed_tools = self.mcp.default_allowed_tools();
            if interactive.is_some() {
                allowed_tools.push(format!("mcp__{}", PERMISSION_SERVER));
            }
        }

        InvocationParams {
            prompt: request.prompt.clone(),
            working_dir: request.working_dir.clone(),
            permission_mode: if interactive.is_some() {
                PermissionMode::Default
            } else {
                PermissionMode::BypassPermissions
            },
            append_system_prompt: request.append_system_prompt.clone(),
            allowed_tools,
            mcp_servers,
            resume: request
                .session
                .as_ref()
                .and_then(|s| s.continuation_token()),
            permission_prompt_tool: interactive.map(|_| self.permission_prompt.tool_name.clone()),
            env: Default::default(),
        }
    }

    /// Submit a prompt and get its records in emission order
    pub async fn stream_query(&self, request: QueryRequest) -> Result<QueryStream, QueryError> {
        let params = self.build_params(&request);

        match params.resume {
            Some(ref token) => tracing::debug!(session_id = %token, "Resuming session"),
            None => tracing::debug!("Starting new Claude conversation"),
        }
        tracing::info!(env = ?self.env_info, "Claude environment state before query");
        tracing::info!(
            transport = self.transport.name(),
            session = ?request.session.as_ref().map(|s| s.key().to_string()),
            prompt_length = params.prompt.len(),
            prompt_preview = %params.prompt_preview(),
            working_dir = ?params.working_dir,
            has_session_id = params.is_resume(),
            permission_mode = %params.permission_mode,
            mcp_server_count = params.mcp_servers.len(),
            has_append_system_prompt = params.append_system_prompt.is_some(),
            "Starting Claude query"
        );

        if let Some(ref session) = request.session {
            session.touch();
        }

        let reporter = FailureReporter {
            probe: self.probe.clone(),
            env_info: self.env_info.clone(),
            working_dir: params.working_dir.clone(),
            resumed: params.is_resume(),
        };
        let cancel = request.cancel.unwrap_or_default();

        match self.transport.stream_query(params, cancel).await {
            Ok(receiver) => Ok(QueryStream {
                receiver,
                transport: Arc::clone(&self.transport),
                session: request.session,
                captured: None,
                reporter,
            }),
            Err(e) => {
                reporter.report(&e).await;
                Err(e)
            }
        }
    }
}

fn forget_session(transport: &dyn Transport, session: &Session) {
    if let Some(token) = session.continuation_token() {
        tracing::debug!(session = %session.key(), session_id = %token, "Releasing session");
        transport.forget(&token);
    }
}

/// Records of one query. Ends with `None`, after at most one error.
pub struct QueryStream {
    receiver: RecordReceiver,
    transport: Arc<dyn Transport>,
    session: Option<Session>,
    /// First init token seen in this query
    captured: Option<String>,
    reporter: FailureReporter,
}

impl QueryStream {
    pub async fn next(&mut self) -> Option<Result<OutputRecord, QueryError>> {
        match self.receiver.recv().await? {
            Ok(record) => {
                if self.captured.is_none() && record.is_init() {
                    if let Some(token) = record.session_id() {
                        self.capture(token, record.model());
                    }
                }
                if record.kind() == RecordKind::Error {
                    self.reporter.report_record(&record);
                }
                Some(Ok(record))
            }
            Err(e) => {
                self.reporter.report(&e).await;
                Some(Err(e))
            }
        }
    }

    fn capture(&mut self, token: &str, model: Option<&str>) {
        self.captured = Some(token.to_string());
        let Some(ref session) = self.session else {
            return;
        };
        let previous = session.continuation_token();
        session.set_continuation_token(token);
        tracing::info!(
            session = %session.key(),
            session_id = %token,
            model = ?model,
            "Session initialized"
        );
        // The old conversation can no longer be resumed from this session
        if let Some(previous) = previous.filter(|p| p != token) {
            self.transport.forget(&previous);
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<OutputRecord, QueryError>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        // Without a session nothing can resume this conversation
        if self.session.is_none() {
            if let Some(ref token) = self.captured {
                self.transport.forget(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codebridge_agent::ScriptedTransport;

    fn dispatcher(mcp: McpManager) -> QueryDispatcher {
        QueryDispatcher::new(Arc::new(ScriptedTransport::new()), mcp)
    }

    fn github_servers() -> McpManager {
        let mut servers = codebridge_agent::McpServers::new();
        servers.insert(
            "github".to_string(),
            McpServerSpec {
                command: "github-mcp".to_string(),
                ..Default::default()
            },
        );
        McpManager::new(servers)
    }

    fn context() -> CallerContext {
        CallerContext {
            channel: "C1".to_string(),
            thread: Some("1700.1".to_string()),
            user: "U1".to_string(),
        }
    }

    #[test]
    fn test_non_interactive_bypasses_permissions() {
        let params = dispatcher(McpManager::default()).build_params(&QueryRequest::new("hi"));
        assert_eq!(params.permission_mode, PermissionMode::BypassPermissions);
        assert!(params.mcp_servers.is_empty());
        assert!(params.allowed_tools.is_empty());
        assert!(params.permission_prompt_tool.is_none());
    }

    #[test]
    fn test_interactive_adds_permission_relay() {
        let request = QueryRequest::new("hi").with_caller_context(context());
        let params = dispatcher(github_servers()).build_params(&request);

        assert_eq!(params.permission_mode, PermissionMode::Default);
        assert_eq!(
            params.allowed_tools,
            vec!["mcp__github", "mcp__permission-prompt"]
        );
        assert_eq!(
            params.permission_prompt_tool.as_deref(),
            Some("mcp__permission-prompt__permission_prompt")
        );

        let relay = &params.mcp_servers[PERMISSION_SERVER];
        assert_eq!(relay.command, "permission-prompt-mcp");
        let ctx: serde_json::Value = serde_json::from_str(&relay.env[CALLER_CONTEXT_ENV]).unwrap();
        assert_eq!(
            ctx,
            serde_json::json!({"channel": "C1", "threadTs": "1700.1", "user": "U1"})
        );
    }

    #[test]
    fn test_interactive_without_configured_servers() {
        let request = QueryRequest::new("hi").with_caller_context(context());
        let params = dispatcher(McpManager::default()).build_params(&request);

        assert_eq!(params.mcp_servers.len(), 1);
        assert_eq!(params.allowed_tools, vec!["mcp__permission-prompt"]);
    }

    #[test]
    fn test_configured_servers_get_default_tools() {
        let params = dispatcher(github_servers()).build_params(&QueryRequest::new("hi"));
        assert_eq!(params.allowed_tools, vec!["mcp__github"]);
        assert!(params.mcp_servers.contains_key("github"));
        assert!(!params.mcp_servers.contains_key(PERMISSION_SERVER));
    }

    #[test]
    fn test_request_fields_carried() {
        let request = QueryRequest::new("fix it")
            .with_working_dir("/srv/repo")
            .with_system_prompt("be terse");
        let params = dispatcher(McpManager::default()).build_params(&request);
        assert_eq!(params.prompt, "fix it");
        assert_eq!(params.working_dir, Some(PathBuf::from("/srv/repo")));
        assert_eq!(params.append_system_prompt.as_deref(), Some("be terse"));
        assert!(params.resume.is_none());
    }

    /// Log sink shared between the subscriber and the test
    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_error_result_logged_with_context() {
        let logs = Captured::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = ScriptedTransport::new().respond_with(vec![
            serde_json::json!({"type": "system", "subtype": "init", "session_id": "T1"}),
            serde_json::json!({"type": "result", "subtype": "error_during_execution", "is_error": true, "error": "Overloaded", "session_id": "T1"}),
        ]);
        let dispatcher = QueryDispatcher::new(Arc::new(transport), McpManager::default());
        let mut stream = dispatcher
            .stream_query(QueryRequest::new("go").with_working_dir("/srv/repo"))
            .await
            .unwrap();
        let mut kinds = Vec::new();
        while let Some(item) = stream.next().await {
            kinds.push(item.unwrap().kind());
        }
        assert_eq!(kinds, vec![RecordKind::Init, RecordKind::Error]);

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = text
            .lines()
            .find(|l| l.contains("Claude query returned an error result"))
            .expect("error result was not logged");
        assert!(line.contains("ERROR"));
        assert!(line.contains("Overloaded"));
        assert!(line.contains("T1"));
        assert!(line.contains("/srv/repo"));
    }
}

// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Resolves backend mode, credentials and the OpenRouter remap into explicit values
use crate::paths;
use anyhow::{Context, Result};
use codebridge_agent::SdkConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_PERMISSION_TOOL: &str = "mcp__permission-prompt__permission_prompt";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub permission_prompt: PermissionPromptConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Which transport answers queries
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Spawn the Claude CLI per query
    #[default]
    Cli,
    /// Call the Messages API in-process
    Sdk,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Sdk => "sdk",
        }
    }
}

impl FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" | "local" => Ok(Self::Cli),
            "sdk" => Ok(Self::Sdk),
            other => anyhow::bail!("Unknown backend mode '{}'. Use 'cli' or 'sdk'", other),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendMode,
    /// Explicit CLI executable; otherwise well-known locations are searched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    /// Alternate API endpoint, also the target of the reachability probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub use_bedrock: bool,
    #[serde(default)]
    pub use_vertex: bool,
}

// Custom Debug impl to redact api_key and auth_token
impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("mode", &self.mode)
            .field("cli_path", &self.cli_path)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("use_bedrock", &self.use_bedrock)
            .field("use_vertex", &self.use_vertex)
            .finish()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            cli_path: None,
            base_url: None,
            api_key: None,
            auth_token: None,
            model: None,
            max_tokens: default_max_tokens(),
            use_bedrock: false,
            use_vertex: false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
}

// Custom Debug impl to redact api_key
impl std::fmt::Debug for OpenRouterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterConfig")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            base_url: default_openrouter_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: default_max_idle_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Path of the `mcp-servers.json` declarations file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

/// The auxiliary server that relays permission prompts back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPromptConfig {
    #[serde(default = "default_permission_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_permission_tool")]
    pub tool_name: String,
}

impl Default for PermissionPromptConfig {
    fn default() -> Self {
        Self {
            command: default_permission_command(),
            args: Vec::new(),
            env: BTreeMap::new(),
            tool_name: default_permission_tool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_openrouter_base_url() -> String {
    DEFAULT_OPENROUTER_BASE_URL.to_string()
}

fn default_max_idle_secs() -> u64 {
    1800 // 30 minutes
}

fn default_reclaim_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_permission_command() -> String {
    "permission-prompt-mcp".to_string()
}

fn default_permission_tool() -> String {
    DEFAULT_PERMISSION_TOOL.to_string()
}

fn default_probe_timeout_secs() -> u64 {
    5
}

/// "1" and "true" switch a flag on
fn env_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True")
}

/// Redacted view of the backend environment, safe to log
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EnvDebugInfo {
    pub mode: &'static str,
    pub base_url: Option<String>,
    pub has_api_key: bool,
    pub has_auth_token: bool,
    pub use_bedrock: bool,
    pub use_vertex: bool,
    pub openrouter: bool,
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. CODEBRIDGE_CONFIG_PATH env var (if set)
    /// 2. ./config.toml
    /// 3. ~/.config/codebridge/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("CODEBRIDGE_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from file with environment variable overrides
    pub fn load() -> Result<Self> {
        let config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.finish(|key| std::env::var(key).ok())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    /// Apply overrides from `var`, remap OpenRouter, then validate
    pub fn finish(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        self.apply_overrides(var)?;
        self.apply_openrouter();
        self.validate()?;
        Ok(self)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(val) = var("CLAUDE_MODE") {
            self.backend.mode = val.parse()?;
        }
        if let Some(val) = var("CLAUDE_CLI_PATH") {
            self.backend.cli_path = Some(val);
        }
        if let Some(val) = var("ANTHROPIC_BASE_URL") {
            self.backend.base_url = Some(val);
        }
        if let Some(val) = var("ANTHROPIC_API_KEY") {
            self.backend.api_key = Some(val);
        }
        if let Some(val) = var("ANTHROPIC_AUTH_TOKEN") {
            self.backend.auth_token = Some(val);
        }
        if let Some(val) = var("CLAUDE_MODEL") {
            self.backend.model = Some(val);
        }
        if let Some(val) = var("CLAUDE_CODE_USE_BEDROCK") {
            self.backend.use_bedrock = env_flag(&val);
        }
        if let Some(val) = var("CLAUDE_CODE_USE_VERTEX") {
            self.backend.use_vertex = env_flag(&val);
        }
        if let Some(val) = var("CLAUDE_CODE_USE_OPENROUTER") {
            self.openrouter.enabled = env_flag(&val);
        }
        if let Some(val) = var("OPENROUTER_API_KEY") {
            self.openrouter.api_key = Some(val);
        }
        if let Some(val) = var("OPENROUTER_BASE_URL") {
            self.openrouter.base_url = val;
        }
        if let Some(val) = var("MCP_CONFIG_PATH") {
            self.mcp.config_path = Some(val);
        }
        if let Some(val) = var("SESSION_MAX_IDLE_SECS") {
            self.sessions.max_idle_secs = val.parse().with_context(|| {
                format!("SESSION_MAX_IDLE_SECS must be a valid number, got: {}", val)
            })?;
        }
        Ok(())
    }

    /// OpenRouter replaces the endpoint and uses its key as bearer token
    fn apply_openrouter(&mut self) {
        if !self.openrouter.enabled {
            return;
        }
        self.backend.base_url = Some(self.openrouter.base_url.clone());
        self.backend.auth_token = self.openrouter.api_key.clone();
        self.backend.api_key = None;
        tracing::info!(base_url = %self.openrouter.base_url, "OpenRouter endpoint enabled");
    }

    fn validate(&self) -> Result<()> {
        if self.openrouter.enabled
            && self
                .openrouter
                .api_key
                .as_deref()
                .map_or(true, |k| k.trim().is_empty())
        {
            anyhow::bail!("OPENROUTER_API_KEY is required when CLAUDE_CODE_USE_OPENROUTER=1");
        }
        if self.backend.mode == BackendMode::Sdk
            && self.backend.api_key.is_none()
            && self.backend.auth_token.is_none()
        {
            anyhow::bail!(
                "sdk mode needs backend.api_key or backend.auth_token (or ANTHROPIC_API_KEY / ANTHROPIC_AUTH_TOKEN)"
            );
        }
        if let Some(ref url) = self.backend.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("backend.base_url must be an http(s) URL, got: {}", url);
            }
        }
        if self.sessions.reclaim_interval_secs == 0 {
            anyhow::bail!("sessions.reclaim_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Explicit settings for the in-process transport
    pub fn sdk_config(&self) -> SdkConfig {
        let defaults = SdkConfig::default();
        SdkConfig {
            base_url: self.backend.base_url.clone().unwrap_or(defaults.base_url),
            api_key: self.backend.api_key.clone(),
            auth_token: self.backend.auth_token.clone(),
            model: self.backend.model.clone().unwrap_or(defaults.model),
            max_tokens: self.backend.max_tokens,
            connect_timeout_secs: defaults.connect_timeout_secs,
        }
    }

    /// Variables each spawned CLI gets on top of the inherited environment
    pub fn cli_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(ref url) = self.backend.base_url {
            env.insert("ANTHROPIC_BASE_URL".to_string(), url.clone());
        }
        if let Some(ref token) = self.backend.auth_token {
            env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), token.clone());
        }
        match self.backend.api_key {
            Some(ref key) => {
                env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
            }
            // Blank out an inherited key so it cannot shadow the bearer token
            None if self.openrouter.enabled => {
                env.insert("ANTHROPIC_API_KEY".to_string(), String::new());
            }
            None => {}
        }
        if let Some(ref model) = self.backend.model {
            env.insert("ANTHROPIC_MODEL".to_string(), model.clone());
        }
        if self.backend.use_bedrock {
            env.insert("CLAUDE_CODE_USE_BEDROCK".to_string(), "1".to_string());
        }
        if self.backend.use_vertex {
            env.insert("CLAUDE_CODE_USE_VERTEX".to_string(), "1".to_string());
        }
        env
    }

    pub fn env_debug_info(&self) -> EnvDebugInfo {
        EnvDebugInfo {
            mode: self.backend.mode.as_str(),
            base_url: self.backend.base_url.clone(),
            has_api_key: self.backend.api_key.is_some(),
            has_auth_token: self.backend.auth_token.is_some(),
            use_bedrock: self.backend.use_bedrock,
            use_vertex: self.backend.use_vertex,
            openrouter: self.openrouter.enabled,
        }
    }

    /// Declarations file: configured path, then ./mcp-servers.json, then the XDG config dir
    pub fn mcp_servers_path(&self) -> PathBuf {
        if let Some(ref path) = self.mcp.config_path {
            return PathBuf::from(path);
        }
        let local = PathBuf::from("mcp-servers.json");
        if local.exists() {
            return local;
        }
        paths::mcp_servers_file()
    }
}

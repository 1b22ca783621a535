// ABOUTME: Per-call invocation parameters and their translation to Claude CLI arguments.
// ABOUTME: Built fresh for every query; flag order is fixed.

use crate::mcp::McpServers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How the backend treats sensitive tool actions
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Ask before sensitive actions (interactive callers)
    #[default]
    Default,
    /// Skip all permission checks (trusted, non-interactive callers)
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one backend call needs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationParams {
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub permission_mode: PermissionMode,
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub mcp_servers: McpServers,
    /// Continuation token to resume, if any
    pub resume: Option<String>,
    /// Tool the backend should route permission prompts through
    pub permission_prompt_tool: Option<String>,
    /// Extra variables for a spawned backend process, on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl InvocationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn is_resume(&self) -> bool {
        self.resume.is_some()
    }

    /// Short prompt preview for logs
    pub fn prompt_preview(&self) -> String {
        const PREVIEW: usize = 100;
        let mut preview: String = self.prompt.chars().take(PREVIEW).collect();
        if self.prompt.chars().count() > PREVIEW {
            preview.push_str("...");
        }
        preview
    }

    /// Claude CLI argument list. `mcp_config` is the path of the written
    /// auxiliary server file, when there is one.
    pub fn cli_args(&self, mcp_config: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            self.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(ref token) = self.resume {
            args.push("--resume".to_string());
            args.push(token.clone());
        }

        if self.permission_mode == PermissionMode::BypassPermissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if let Some(ref text) = self.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(text.clone());
        }

        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.extend(self.allowed_tools.iter().cloned());
        }

        if let Some(path) = mcp_config {
            args.push("--mcp-config".to_string());
            args.push(path.to_string_lossy().to_string());
        }

        if let Some(ref tool) = self.permission_prompt_tool {
            args.push("--permission-prompt-tool".to_string());
            args.push(tool.clone());
        }

        args
    }
}

// ABOUTME: Auxiliary (MCP) server declarations loaded from mcp-servers.json
// ABOUTME: Supplies the server map and the default mcp__<name> allow-list to the dispatcher

use anyhow::{Context, Result};
use codebridge_agent::McpServers;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpServersFile {
    #[serde(default)]
    mcp_servers: McpServers,
}

#[derive(Debug, Clone, Default)]
pub struct McpManager {
    servers: McpServers,
    source: Option<PathBuf>,
}

impl McpManager {
    /// Build from an already-known server map
    pub fn new(servers: McpServers) -> Self {
        Self {
            servers,
            source: None,
        }
    }

    /// Load `{"mcpServers": {...}}`. A missing file means no servers.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No MCP configuration file, no servers");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: McpServersFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        for (name, spec) in &file.mcp_servers {
            if spec.command.trim().is_empty() {
                anyhow::bail!("MCP server '{}' has an empty command", name);
            }
        }

        tracing::info!(
            path = %path.display(),
            servers = ?file.mcp_servers.keys().collect::<Vec<_>>(),
            "Loaded MCP server configuration"
        );
        Ok(Self {
            servers: file.mcp_servers,
            source: Some(path.to_path_buf()),
        })
    }

    pub fn servers(&self) -> &McpServers {
        &self.servers
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// `mcp__<name>` for every configured server
    pub fn default_allowed_tools(&self) -> Vec<String> {
        self.servers
            .keys()
            .map(|name| format!("mcp__{}", name))
            .collect()
    }
}

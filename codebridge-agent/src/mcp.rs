// ABOUTME: Auxiliary (MCP) server declarations and the transient config file handed to the CLI.
// ABOUTME: The file lives exactly as long as its guard and is deleted on drop.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// One stdio MCP server the backend may launch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Server name → declaration
pub type McpServers = BTreeMap<String, McpServerSpec>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct McpConfigDocument<'a> {
    mcp_servers: &'a McpServers,
}

/// A written `{"mcpServers": {...}}` document, removed when dropped
#[derive(Debug)]
pub struct McpConfigFile {
    file: NamedTempFile,
}

impl McpConfigFile {
    /// Write the servers to a fresh file in the system temp dir
    pub fn write(servers: &McpServers) -> std::io::Result<Self> {
        Self::write_in(&std::env::temp_dir(), servers)
    }

    pub fn write_in(dir: &Path, servers: &McpServers) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("claude-mcp-")
            .suffix(".json")
            .tempfile_in(dir)?;
        let doc = McpConfigDocument {
            mcp_servers: servers,
        };
        serde_json::to_writer_pretty(&mut file, &doc)?;
        file.flush()?;
        tracing::debug!(
            path = %file.path().display(),
            servers = servers.len(),
            "Wrote MCP config file"
        );
        Ok(Self { file })
    }

    /// Write a file only if there is something to declare
    pub fn write_if_any(servers: &McpServers) -> std::io::Result<Option<Self>> {
        if servers.is_empty() {
            return Ok(None);
        }
        Self::write(servers).map(Some)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

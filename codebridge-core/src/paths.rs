// ABOUTME: XDG Base Directory paths for config, MCP declarations and logs
// ABOUTME: Falls back to the working directory when no home directory is known

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "dev";
const ORGANIZATION: &str = "codebridge";
const APPLICATION: &str = "codebridge";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// e.g., ~/.local/share/codebridge/
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// e.g., ~/.local/share/codebridge/logs/
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// e.g., ~/.config/codebridge/
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Auxiliary server declarations next to the config file
pub fn mcp_servers_file() -> PathBuf {
    config_dir().join("mcp-servers.json")
}

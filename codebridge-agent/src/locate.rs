// ABOUTME: Locates the Claude CLI executable.
// ABOUTME: Configured path, then well-known install locations, then PATH lookup.

use std::path::{Path, PathBuf};

/// Name resolved through `PATH` when nothing else matches
pub const DEFAULT_BINARY: &str = "claude";

/// Resolve the CLI to launch. First existing match wins.
pub fn locate_cli(configured: Option<&Path>) -> PathBuf {
    locate_cli_in(configured, &default_locations())
}

/// Same as [`locate_cli`] with an explicit candidate list
pub fn locate_cli_in(configured: Option<&Path>, candidates: &[PathBuf]) -> PathBuf {
    if let Some(path) = configured.filter(|p| *p != Path::new(DEFAULT_BINARY)) {
        if path.exists() {
            return path.to_path_buf();
        }
        tracing::warn!(
            path = %path.display(),
            "Configured Claude CLI path not found, falling back to default locations"
        );
    }

    for candidate in candidates {
        if candidate.exists() {
            tracing::info!(path = %candidate.display(), "Found claude CLI");
            return candidate.clone();
        }
    }

    PathBuf::from(DEFAULT_BINARY)
}

/// Platform-specific install locations, in lookup order
pub fn default_locations() -> Vec<PathBuf> {
    let home = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf());
    let mut paths = Vec::new();

    if cfg!(windows) {
        let local_app_data = std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|h| h.join("AppData").join("Local")));
        if let Some(local) = local_app_data {
            paths.push(local.join("Programs").join("claude-code").join("claude.exe"));
        }
        if let Some(ref home) = home {
            paths.push(home.join(".npm-global").join("claude.cmd"));
        }
    } else {
        paths.push(PathBuf::from("/usr/local/bin/claude"));
        if let Some(ref home) = home {
            paths.push(home.join(".local").join("bin").join("claude"));
            paths.push(home.join(".npm-global").join("bin").join("claude"));
        }
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let configured = dir.path().join("my-claude");
        let candidate = dir.path().join("other-claude");
        std::fs::write(&configured, "").unwrap();
        std::fs::write(&candidate, "").unwrap();

        let found = locate_cli_in(Some(&configured), &[candidate]);
        assert_eq!(found, configured);
    }

    #[test]
    fn test_missing_configured_path_falls_back_to_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let absent = dir.path().join("absent");
        let present = dir.path().join("present");
        let also_present = dir.path().join("also-present");
        std::fs::write(&present, "").unwrap();
        std::fs::write(&also_present, "").unwrap();

        let found = locate_cli_in(Some(&missing), &[absent, present.clone(), also_present]);
        assert_eq!(found, present);
    }

    #[test]
    fn test_bare_default_name_is_treated_as_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("claude");
        std::fs::write(&present, "").unwrap();

        let found = locate_cli_in(Some(Path::new("claude")), &[present.clone()]);
        assert_eq!(found, present);
    }

    #[test]
    fn test_falls_back_to_path_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let found = locate_cli_in(None, &[dir.path().join("missing")]);
        assert_eq!(found, PathBuf::from(DEFAULT_BINARY));
    }

    #[test]
    fn test_default_locations_not_empty() {
        assert!(!default_locations().is_empty());
    }
}

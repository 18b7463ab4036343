//! Configuration file handling for edge-cli
//!
//! The CLI reads the same TOML file as `edged` so both agree on the
//! interface, state directory and broker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use edge_agent::AgentConfig;

/// Load the agent configuration
///
/// An explicit path must exist. Without one, the per-user config file is
/// used when present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    if let Some(path) = path {
        return AgentConfig::load(path).with_context(|| format!("Failed to load config: {}", path.display()));
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            AgentConfig::load(&path).with_context(|| format!("Failed to load config: {}", path.display()))
        }
        _ => Ok(AgentConfig::default()),
    }
}

/// `~/.config/edged/edged.toml` on Linux
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("edged").join("edged.toml"))
}

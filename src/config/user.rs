//! User configuration loading for swankbridge.
//!
//! User config location: $XDG_CONFIG_HOME/swankbridge/swankbridge.toml
//! Fallback: the platform config directory reported by `dirs`.

use std::path::{Path, PathBuf};
use thiserror::Error;

use super::BridgeConfig;

pub const CONFIG_FILE_NAME: &str = "swankbridge.toml";

#[derive(Debug, Error)]
pub enum UserConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type UserConfigResult<T> = Result<T, UserConfigError>;

/// Returns the path to the user configuration file.
///
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/swankbridge/swankbridge.toml
/// 2. Otherwise: `dirs::config_dir()`/swankbridge/swankbridge.toml
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    Some(base.join("swankbridge").join(CONFIG_FILE_NAME))
}

/// Load the user configuration; `Ok(None)` when no file exists.
pub fn load_user_config() -> UserConfigResult<Option<BridgeConfig>> {
    match user_config_path() {
        Some(path) if path.exists() => load_config_file(&path).map(Some),
        _ => Ok(None),
    }
}

/// Parse one TOML configuration file.
pub fn load_config_file(path: &Path) -> UserConfigResult<BridgeConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| UserConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| UserConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

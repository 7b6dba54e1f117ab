//! Configuration Loading
//!
//! Reads and validates the JSON configuration file. Unlike a desktop config
//! store there is no fallback to defaults: a proxy started without its hub
//! settings cannot do anything useful, so every problem is reported.

use std::path::{Path, PathBuf};

use tokio::fs;

use super::types::ProxyConfig;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Load and validate the configuration file at `path`
pub async fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let config: ProxyConfig = serde_json::from_str(&contents)?;
    validate(&config)?;

    tracing::debug!("Loaded configuration from {:?}", path);
    Ok(config)
}

/// Check the values serde cannot check on its own
pub fn validate(config: &ProxyConfig) -> Result<(), ConfigError> {
    let hub = &config.jupyterhub;

    if !(hub.url.starts_with("http://") || hub.url.starts_with("https://")) {
        return Err(ConfigError::Invalid(format!(
            "jupyterhub.url must be an http(s) URL, got {:?}",
            hub.url
        )));
    }

    if hub.conn_user.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "jupyterhub.conn_user must not be empty".into(),
        ));
    }

    if hub.ssh_port == 0 {
        return Err(ConfigError::Invalid("jupyterhub.ssh_port must not be 0".into()));
    }

    if hub.admin_token.is_empty() {
        tracing::warn!("jupyterhub.admin_token is empty; route lookups will fail");
    }

    if config.limits.max_sessions == Some(0) {
        return Err(ConfigError::Invalid("limits.max_sessions must be > 0".into()));
    }

    if config.limits.max_channels_per_connection == Some(0) {
        return Err(ConfigError::Invalid(
            "limits.max_channels_per_connection must be > 0".into(),
        ));
    }

    Ok(())
}

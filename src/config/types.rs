//! Configuration file types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level proxy configuration file (JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the SSH listener binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path to the proxy's SSH host private key (OpenSSH format)
    pub host_key_path: PathBuf,

    /// JupyterHub API and backend account settings
    pub jupyterhub: HubConfig,

    /// Outbound session settings
    #[serde(default)]
    pub backend: BackendSettings,

    /// Admission limits
    #[serde(default)]
    pub limits: Limits,

    /// Transform applied to backend-to-caller data
    #[serde(default)]
    pub filter: FilterKind,
}

/// JupyterHub settings
#[derive(Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// API base URL, e.g. `http://hub:8081/hub/api`
    pub url: String,

    /// Admin token used for `/proxy` route lookups
    #[serde(default)]
    pub admin_token: String,

    /// Service account on every single-user pod
    pub conn_user: String,

    /// Service account password
    #[serde(default)]
    pub conn_passwd: String,

    /// SSH port of the single-user pods
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Verify the hub's TLS certificate
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("url", &self.url)
            .field("admin_token", &"<redacted>")
            .field("conn_user", &self.conn_user)
            .field("conn_passwd", &"<redacted>")
            .field("ssh_port", &self.ssh_port)
            .field("verify_tls", &self.verify_tls)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            admin_token: String::new(),
            conn_user: String::new(),
            conn_passwd: String::new(),
            ssh_port: default_ssh_port(),
            verify_tls: true,
            timeout_secs: default_timeout(),
        }
    }
}

/// Outbound SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Connect + authenticate deadline in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Optional SHA-256 host key pin (`SHA256:...`); unset accepts any key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_timeout(),
            host_key_fingerprint: None,
        }
    }
}

/// Admission limits; `None` means unbounded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_channels_per_connection: Option<usize>,
}

/// Backend-to-caller stream transform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// `\n` becomes `\r\n`
    #[default]
    Crlf,
    /// Bytes pass through untouched
    None,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    10
}

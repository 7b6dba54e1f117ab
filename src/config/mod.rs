//! Configuration Module
//!
//! JSON configuration file for the proxy: listener, hub API, backend account,
//! admission limits and output filtering.

pub mod storage;
pub mod types;

pub use storage::{load_config, validate, ConfigError};
pub use types::{BackendSettings, FilterKind, HubConfig, Limits, ProxyConfig};

use crate::ssh::{BackendConfig, HostKeyPolicy, ServiceAccount};

impl ProxyConfig {
    /// Outbound session settings derived from the hub section
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(ServiceAccount::new(
            self.jupyterhub.conn_user.clone(),
            self.jupyterhub.conn_passwd.clone(),
        ))
        .with_timeout(self.backend.connect_timeout_secs)
        .with_host_key(HostKeyPolicy::from_fingerprint(
            self.backend.host_key_fingerprint.clone(),
        ))
    }
}

//! hub-ssh-proxy - SSH front door for JupyterHub single-user pods
//!
//! Callers log in with their hub username and API token; the proxy looks up
//! the user's pod through the hub API, opens its own SSH session to the pod
//! with a service account and splices the two sessions channel by channel.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cli;
pub mod config;
pub mod directory;
pub mod proxy;
pub mod ssh;

use config::ProxyConfig;
use directory::{DirectoryError, HubClient};
use proxy::{filter_for, HubPolicy, ProxyContext};
use ssh::SshConnector;

/// Install the global subscriber; `RUST_LOG` wins over `default_level`
pub fn init_logging(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Wire the hub client, backend connector and filter from configuration
pub fn build_context(config: &ProxyConfig) -> Result<Arc<ProxyContext>, DirectoryError> {
    let hub = HubClient::new(&config.jupyterhub)?;
    let policy = HubPolicy::new(Arc::new(hub), config.jupyterhub.ssh_port);
    let connector = SshConnector::new(config.backend_config());

    Ok(Arc::new(ProxyContext {
        policy: Arc::new(policy),
        connector: Arc::new(connector),
        filter: filter_for(config.filter),
        max_channels: config.limits.max_channels_per_connection,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_context() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{
                "host_key_path": "./etc/ssh_host_ed25519_key",
                "jupyterhub": {"url": "http://hub:8081/hub/api", "conn_user": "jovyan"},
                "limits": {"max_channels_per_connection": 4},
                "filter": "none"
            }"#,
        )
        .unwrap();

        let ctx = build_context(&config).unwrap();
        assert_eq!(ctx.max_channels, Some(4));
        assert_eq!(ctx.filter.name(), "none");
    }
}

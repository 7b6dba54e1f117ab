//! Outbound SSH client: one backend session per authenticated caller

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, info, warn};

use super::config::{BackendConfig, HostKeyPolicy};
use super::error::ProxyError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};

/// Originates the outbound session for an authenticated caller.
///
/// Implementations only ever receive the backend address; the caller's own
/// credential is not part of this interface.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, target: SocketAddr, conn_id: &str)
        -> Result<HandleController, ProxyError>;
}

/// russh-backed connector logging in with the service account
pub struct SshConnector {
    config: BackendConfig,
}

impl SshConnector {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendConnector for SshConnector {
    async fn connect(
        &self,
        target: SocketAddr,
        conn_id: &str,
    ) -> Result<HandleController, ProxyError> {
        info!(conn_id = %conn_id, "Connecting to backend at {}", target);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = BackendHandler::new(target, self.config.host_key.clone());
        let deadline = Duration::from_secs(self.config.timeout_secs);

        let mut handle = tokio::time::timeout(
            deadline,
            client::connect(Arc::new(ssh_config), target, handler),
        )
        .await
        .map_err(|_| ProxyError::Timeout(format!("Backend {} did not answer", target)))?
        .map_err(|e| ProxyError::ConnectionFailed(e.to_string()))?;

        debug!(conn_id = %conn_id, "Backend handshake completed");

        let account = &self.config.account;
        let authenticated = tokio::time::timeout(
            deadline,
            handle.authenticate_password(&account.username, &account.password),
        )
        .await
        .map_err(|_| ProxyError::Timeout(format!("Backend {} authentication", target)))?
        .map_err(|e| ProxyError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(ProxyError::AuthenticationFailed(format!(
                "Backend {} rejected the service credential",
                target
            )));
        }

        info!(conn_id = %conn_id, "Backend session established with {}", target);

        Ok(spawn_handle_owner_task(handle, conn_id.to_string()))
    }
}

/// Client handler for the outbound session
pub struct BackendHandler {
    target: SocketAddr,
    host_key: HostKeyPolicy,
}

impl BackendHandler {
    pub fn new(target: SocketAddr, host_key: HostKeyPolicy) -> Self {
        Self { target, host_key }
    }
}

impl client::Handler for BackendHandler {
    type Error = ProxyError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        if self.host_key.accepts(&fingerprint) {
            debug!("Backend {} host key {}", self.target, fingerprint);
            return Ok(true);
        }

        warn!(
            "Backend {} presented host key {} which does not match the pinned key",
            self.target, fingerprint
        );
        Err(ProxyError::ConnectionFailed(format!(
            "Host key verification failed for {}: {}",
            self.target, fingerprint
        )))
    }
}

//! Connection acceptor
//!
//! Binds the listening socket and runs one russh server session per
//! accepted TCP connection, each in its own task.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server::{self, run_stream};
use russh::{MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handler::{ProxyContext, ProxyHandler};
use super::session::ConnectionSession;
use crate::ssh::ProxyError;

/// How long a session gets to wind down after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Load the proxy's host key (OpenSSH private key, unencrypted)
pub fn load_host_key(path: &Path) -> Result<PrivateKey, ProxyError> {
    let key = russh::keys::load_secret_key(path, None)?;
    debug!("Loaded {} host key from {:?}", key.algorithm(), path);
    Ok(key)
}

/// russh server settings for the inbound side
pub fn server_config(host_key: PrivateKey) -> server::Config {
    server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        methods: MethodSet::from(&[MethodKind::KeyboardInteractive, MethodKind::Password][..]),
        keys: vec![host_key],
        ..Default::default()
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    ssh_config: Arc<server::Config>,
    ctx: Arc<ProxyContext>,
    /// Admission limit; `None` is unbounded
    sessions: Option<Arc<Semaphore>>,
}

impl ProxyServer {
    pub async fn bind(
        addr: &str,
        ssh_config: server::Config,
        ctx: Arc<ProxyContext>,
        max_sessions: Option<usize>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::BindFailed(format!("{}: {}", addr, e)))?;

        info!("SSH proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            ssh_config: Arc::new(ssh_config),
            ctx,
            sessions: max_sessions.map(|max| Arc::new(Semaphore::new(max))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` is cancelled or accept fails. Running
    /// sessions are cancelled with `shutdown`, not with an accept failure.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        return Err(e.into());
                    }
                },
            };

            let permit = match &self.sessions {
                Some(sessions) => match sessions.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("Session limit reached, dropping connection from {}", peer);
                        drop(stream);
                        continue;
                    }
                },
                None => None,
            };

            let conn_id = Uuid::new_v4().to_string();
            info!(conn_id = %conn_id, peer = %peer, "Accepted connection");

            tokio::spawn(serve_connection(
                stream,
                peer,
                conn_id,
                self.ssh_config.clone(),
                self.ctx.clone(),
                shutdown.child_token(),
                permit,
            ));
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: String,
    ssh_config: Arc<server::Config>,
    ctx: Arc<ProxyContext>,
    cancel: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id = %conn_id, "Failed to set TCP_NODELAY: {}", e);
    }

    let session = ConnectionSession::new(conn_id.clone(), Some(peer)).with_parent(&cancel);
    let connection_token = session.cancel_token().clone();
    let handler = ProxyHandler::new(ctx, session);

    let running = match run_stream(ssh_config, stream, handler).await {
        Ok(running) => running,
        Err(e) => {
            warn!(conn_id = %conn_id, peer = %peer, "SSH session setup failed: {}", e);
            return;
        }
    };
    let handle = running.handle();
    tokio::pin!(running);

    let result = tokio::select! {
        result = &mut running => result,
        _ = cancel.cancelled() => {
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "Proxy shutting down".into(),
                    "en".into(),
                )
                .await;
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut running).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::Timeout("Session did not close".into())),
            }
        }
    };

    connection_token.cancel();

    match result {
        Ok(()) => info!(conn_id = %conn_id, peer = %peer, "Connection closed"),
        Err(e) => info!(conn_id = %conn_id, peer = %peer, "Connection ended: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::filter::Passthrough;
    use crate::proxy::policy::SessionPolicy;
    use crate::proxy::session::Route;
    use crate::ssh::{BackendConnector, HandleController};
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    const HOST_KEY: &str = include_str!("../../tests/fixtures/proxy_host_ed25519");

    struct DenyAll;

    #[async_trait]
    impl SessionPolicy for DenyAll {
        async fn resolve_route(&self, _username: &str) -> Option<Route> {
            None
        }

        async fn verify_credential(&self, _username: &str, _credential: &str) -> bool {
            false
        }
    }

    #[async_trait]
    impl BackendConnector for DenyAll {
        async fn connect(
            &self,
            _target: SocketAddr,
            _conn_id: &str,
        ) -> Result<HandleController, ProxyError> {
            Err(ProxyError::ConnectionFailed("unused".into()))
        }
    }

    fn context() -> Arc<ProxyContext> {
        Arc::new(ProxyContext {
            policy: Arc::new(DenyAll),
            connector: Arc::new(DenyAll),
            filter: Arc::new(Passthrough),
            max_channels: None,
        })
    }

    fn config() -> server::Config {
        let key = russh::keys::decode_secret_key(HOST_KEY, None).unwrap();
        server_config(key)
    }

    /// First bytes the server sends; empty if it closed the connection
    async fn greeting(addr: SocketAddr) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = ProxyServer::bind(&addr, config(), context(), None).await;
        assert!(matches!(result, Err(ProxyError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_serves_ssh_and_shuts_down() {
        let server = ProxyServer::bind("127.0.0.1:0", config(), context(), None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));

        assert!(greeting(addr).await.starts_with(b"SSH-2.0-"));

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_session_limit_drops_extra_connections() {
        let server = ProxyServer::bind("127.0.0.1:0", config(), context(), Some(1))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = first.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"SSH-2.0-"));

        // First connection still holds the only permit
        assert!(greeting(addr).await.is_empty());

        shutdown.cancel();
    }

    #[test]
    fn test_load_host_key_missing() {
        let result = load_host_key(Path::new("/nonexistent/host_key"));
        assert!(result.is_err());
    }
}

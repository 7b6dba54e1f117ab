//! Per-connection state

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio_util::sync::CancellationToken;

use crate::ssh::HandleController;

/// Resolved backend endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: IpAddr,
    pub port: u16,
    /// Pod name as reported by the hub, when it could be read
    pub pod_name: Option<String>,
}

impl Route {
    pub fn new(host: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            pod_name: None,
        }
    }

    pub fn with_pod_name(mut self, pod_name: Option<String>) -> Self {
        self.pod_name = pod_name;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    /// Route lookup done (target may still be absent)
    Routed,
    /// Credential accepted, backend session attached
    Authenticated,
    /// At least one channel pair running
    Relaying,
    Closed,
}

/// State of one inbound connection. Owned by that connection's handler and
/// never shared with other connections.
pub struct ConnectionSession {
    pub conn_id: String,
    pub peer: Option<SocketAddr>,
    username: Option<String>,
    route: Option<Route>,
    /// Banner computed at route resolution
    banner: Option<String>,
    backend: Option<HandleController>,
    state: SessionState,
    channels_opened: usize,
    /// Cancelled when the inbound connection ends; every channel task of
    /// this connection holds a child of it
    cancel: CancellationToken,
}

impl ConnectionSession {
    pub fn new(conn_id: impl Into<String>, peer: Option<SocketAddr>) -> Self {
        Self {
            conn_id: conn_id.into(),
            peer,
            username: None,
            route: None,
            banner: None,
            backend: None,
            state: SessionState::Handshaking,
            channels_opened: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this connection's cancellation to a wider scope (server shutdown)
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Whether a route lookup for `username` has already been recorded
    pub fn is_routed_for(&self, username: &str) -> bool {
        self.state != SessionState::Handshaking && self.username.as_deref() == Some(username)
    }

    /// Record the outcome of the route lookup; replaces any earlier lookup
    /// made for a different username
    pub fn set_route(&mut self, username: &str, route: Option<Route>, banner: String) {
        self.username = Some(username.to_string());
        self.route = route;
        self.banner = Some(banner);
        if self.state == SessionState::Handshaking || self.state == SessionState::Routed {
            self.state = SessionState::Routed;
        }
    }

    pub fn attach_backend(&mut self, backend: HandleController) {
        self.backend = Some(backend);
        self.state = SessionState::Authenticated;
    }

    pub fn backend(&self) -> Option<&HandleController> {
        self.backend.as_ref()
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened
    }

    /// Count a new channel pair; returns its pairing key (creation order)
    pub fn register_channel(&mut self) -> usize {
        let key = self.channels_opened;
        self.channels_opened += 1;
        self.state = SessionState::Relaying;
        key
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drop the backend and cancel all channel tasks
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.backend = None;
        self.state = SessionState::Closed;
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! Handshake policy
//!
//! The three decisions the handshake needs from the outside world: where a
//! user's backend lives, whether a credential is valid, and what to tell the
//! user before asking for it.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::session::Route;
use crate::directory::Directory;

#[async_trait]
pub trait SessionPolicy: Send + Sync {
    /// Backend endpoint for `username`, if one is running
    async fn resolve_route(&self, username: &str) -> Option<Route>;

    /// Whether `credential` authenticates `username`
    async fn verify_credential(&self, username: &str, credential: &str) -> bool;

    /// Status text shown before the password prompt
    fn banner(&self, username: &str, route: Option<&Route>) -> String {
        default_banner(username, route)
    }
}

/// Pod status text in the form users of the hub are used to
pub fn default_banner(username: &str, route: Option<&Route>) -> String {
    let mut text = String::from("Welcome to JupyterHub SSH Client!\nNow checking pod status...\n");
    match route.map(|r| r.pod_name.as_deref()) {
        Some(Some(pod)) => text.push_str(&format!(
            "Pod {} is running, use your API token to login, have fun!\n",
            pod
        )),
        Some(None) => text.push_str(&format!(
            "Found a running pod for {}, use your API token to login, have fun!\n",
            username
        )),
        None => text.push_str(
            "Did not find a running pod, please make sure your user environment is running!\n",
        ),
    }
    text
}

/// Policy backed by the JupyterHub API
pub struct HubPolicy {
    directory: Arc<dyn Directory>,
    ssh_port: u16,
}

impl HubPolicy {
    pub fn new(directory: Arc<dyn Directory>, ssh_port: u16) -> Self {
        Self {
            directory,
            ssh_port,
        }
    }
}

#[async_trait]
impl SessionPolicy for HubPolicy {
    async fn resolve_route(&self, username: &str) -> Option<Route> {
        let host = self.directory.lookup_target(username).await?;
        let pod_name = self.directory.pod_name(username).await;
        Some(Route::new(IpAddr::V4(host), self.ssh_port).with_pod_name(pod_name))
    }

    async fn verify_credential(&self, username: &str, credential: &str) -> bool {
        self.directory.authorize(username, credential).await
    }
}

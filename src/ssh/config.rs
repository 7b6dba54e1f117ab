//! Outbound SSH configuration

use serde::{Deserialize, Serialize};

/// Fixed credential the proxy uses to log into every backend.
///
/// The caller's own password is never forwarded; backends only ever see this
/// account.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub username: String,
    pub password: String,
}

impl ServiceAccount {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the outbound client treats the backend's host key.
///
/// Backends live inside the cluster network and are recreated with fresh keys,
/// so the default accepts whatever key is presented.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    #[default]
    AcceptAny,
    /// Only accept a key with this SHA-256 fingerprint (`SHA256:...`)
    Pinned(String),
}

impl HostKeyPolicy {
    pub fn from_fingerprint(fingerprint: Option<String>) -> Self {
        match fingerprint {
            Some(fp) if !fp.trim().is_empty() => Self::Pinned(fp.trim().to_string()),
            _ => Self::AcceptAny,
        }
    }

    pub fn accepts(&self, presented: &str) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Pinned(expected) => expected == presented,
        }
    }
}

/// Outbound session settings shared by every connection
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Service credential
    pub account: ServiceAccount,

    /// Connect + authenticate deadline in seconds
    pub timeout_secs: u64,

    /// Host key handling
    pub host_key: HostKeyPolicy,
}

impl BackendConfig {
    pub fn new(account: ServiceAccount) -> Self {
        Self {
            account,
            timeout_secs: default_timeout(),
            host_key: HostKeyPolicy::AcceptAny,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_host_key(mut self, host_key: HostKeyPolicy) -> Self {
        self.host_key = host_key;
        self
    }
}

fn default_timeout() -> u64 {
    10
}

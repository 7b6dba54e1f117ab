//! JupyterHub REST client
//!
//! Two lookups back the proxy's handshake:
//! - `GET {url}/users/{name}` with the caller's token decides whether the
//!   password (a JupyterHub API token) is valid for that user
//! - `GET {url}/proxy` with the admin token yields the routing table, from
//!   which the user's pod address is extracted
//! - `GET {url}/users/{name}` with the admin token names the user's pod for
//!   the status banner
//!
//! Any transport error, non-200 status or unparseable body is reported as
//! "unauthorized" / "no route"; the proxy never fails hard on the hub.

use std::net::Ipv4Addr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::types::{user_route_key, UserInfo, UserRoutes};
use crate::config::HubConfig;

/// Directory lookup errors
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Invalid hub URL {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {0}")]
    Status(StatusCode),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity and route lookups the handshake relies on
#[async_trait]
pub trait Directory: Send + Sync {
    /// Whether `credential` authenticates `username`
    async fn authorize(&self, username: &str, credential: &str) -> bool;

    /// Address of the backend currently serving `username`
    async fn lookup_target(&self, username: &str) -> Option<Ipv4Addr>;

    /// Name of the pod behind the user's default server
    async fn pod_name(&self, username: &str) -> Option<String>;
}

/// First dotted quad with every octet in 0-255
static IPV4_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((2(5[0-5]|[0-4]\d))|[0-1]?\d{1,2})(\.((2(5[0-5]|[0-4]\d))|[0-1]?\d{1,2})){3}")
        .expect("static IPv4 pattern")
});

/// Pull the first IPv4 address out of a route target such as
/// `http://10.0.12.30:8888`
pub fn extract_ipv4(target: &str) -> Option<Ipv4Addr> {
    let found = IPV4_PATTERN.find(target)?.as_str();
    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(found.split('.')) {
        *slot = part.parse().ok()?;
    }
    Some(Ipv4Addr::from(octets))
}

/// JupyterHub API client
pub struct HubClient {
    base_url: Url,
    admin_token: String,
    http: reqwest::Client,
}

impl HubClient {
    pub fn new(config: &HubConfig) -> Result<Self, DirectoryError> {
        let base_url = Url::parse(config.url.trim_end_matches('/'))
            .map_err(|e| DirectoryError::InvalidUrl(format!("{}: {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DirectoryError::InvalidUrl(config.url.clone()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            base_url,
            admin_token: config.admin_token.clone(),
            http,
        })
    }

    /// Build `{base}/{segments...}` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        token: &str,
    ) -> Result<T, DirectoryError> {
        let url = self.endpoint(segments)?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, format!("token {}", token))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(DirectoryError::Status(status));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch a user's record using `token` as the bearer
    pub async fn query_user_info(
        &self,
        username: &str,
        token: &str,
    ) -> Result<UserInfo, DirectoryError> {
        self.get_json(&["users", username], token).await
    }

    /// Fetch the hub proxy's routing table (admin token)
    pub async fn query_user_routes(&self) -> Result<UserRoutes, DirectoryError> {
        self.get_json(&["proxy"], &self.admin_token).await
    }
}

#[async_trait]
impl Directory for HubClient {
    async fn authorize(&self, username: &str, credential: &str) -> bool {
        match self.query_user_info(username, credential).await {
            Ok(info) => {
                debug!(
                    "Hub accepted token for {} (servers: {})",
                    username,
                    info.servers.len()
                );
                true
            }
            Err(DirectoryError::Status(status)) => {
                info!("Hub rejected token for {}: {}", username, status);
                false
            }
            Err(e) => {
                warn!("User lookup for {} failed: {}", username, e);
                false
            }
        }
    }

    async fn lookup_target(&self, username: &str) -> Option<Ipv4Addr> {
        let routes = match self.query_user_routes().await {
            Ok(routes) => routes,
            Err(e) => {
                warn!("Route lookup for {} failed: {}", username, e);
                return None;
            }
        };

        let route = routes.get(&user_route_key(username))?;
        let address = extract_ipv4(&route.target);
        debug!("Route for {}: {} -> {:?}", username, route.target, address);
        address
    }

    async fn pod_name(&self, username: &str) -> Option<String> {
        let info = match self.query_user_info(username, &self.admin_token).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Pod lookup for {} failed: {}", username, e);
                return None;
            }
        };

        info.default_server()?
            .state
            .pod_name
            .clone()
            .filter(|name| !name.is_empty())
    }
}

//! JupyterHub REST API documents
//!
//! Only the fields the proxy reads are modelled; everything else in the
//! responses is ignored. All fields are optional so a partially filled
//! document from an older hub still parses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `GET /users/{name}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub admin: bool,
    /// URL prefix of the default server, e.g. `/user/alice/`
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub last_activity: Option<String>,
    /// Named servers; the default server is keyed by the empty string
    #[serde(default)]
    pub servers: HashMap<String, ServerDetail>,
}

impl UserInfo {
    /// The user's default (unnamed) server, if one is running
    pub fn default_server(&self) -> Option<&ServerDetail> {
        self.servers.get("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub state: ServerState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub pod_name: Option<String>,
}

/// `GET /proxy`: routing table keyed by route spec (`/user/{name}/`)
pub type UserRoutes = HashMap<String, UserRoute>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRoute {
    #[serde(default)]
    pub routespec: String,
    /// Upstream URL, e.g. `http://10.0.12.30:8888`
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub data: RouteData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteData {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub last_activity: Option<String>,
}

/// Route spec under which the hub publishes a user's default server
pub fn user_route_key(username: &str) -> String {
    format!("/user/{}/", username)
}

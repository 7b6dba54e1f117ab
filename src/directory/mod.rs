//! Directory Module
//!
//! Identity and route lookups against the JupyterHub REST API.

pub mod client;
pub mod types;

pub use client::{extract_ipv4, Directory, DirectoryError, HubClient};
pub use types::{user_route_key, ServerDetail, UserInfo, UserRoute, UserRoutes};

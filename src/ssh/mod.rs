//! SSH module - outbound side of the proxy
//!
//! This module drives the backend sessions using the russh client.
//!
//! # Features
//! - Service-account password login to the user's pod
//! - Optional SHA-256 host key pinning
//! - Single owner task per backend Handle (see `handle_owner`)

mod client;
mod config;
mod error;
mod handle_owner;

pub use client::{BackendConnector, BackendHandler, SshConnector};
pub use config::{BackendConfig, HostKeyPolicy, ServiceAccount};
pub use error::ProxyError;
pub use handle_owner::{spawn_handle_owner_task, ChannelKind, HandleCommand, HandleController};

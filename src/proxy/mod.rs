//! Proxy module - inbound side and the relay engine
//!
//! # Architecture
//!
//! ```text
//! ProxyServer ──accept──► ProxyHandler (one per connection)
//!                            │  auth: SessionPolicy + BackendConnector
//!                            │  channel open: HandleController::open_channel
//!                            │  channel requests: forwarded, answered once the backend replies
//!                            ▼
//!                         PairLink ──► ChannelPair tasks (one set per channel)
//!                                        ├─ backend reader (replies, backend messages)
//!                                        ├─ control (EOF, close, exit requests)
//!                                        └─ DataPump x3 (backend->caller through StreamFilter)
//! ```

pub mod filter;
pub mod handler;
pub mod policy;
pub mod relay;
pub mod request;
pub mod server;
pub mod session;

pub use filter::{filter_for, BoxedReader, LineEndings, Passthrough, StreamFilter};
pub use handler::{ProxyContext, ProxyHandler};
pub use policy::{default_banner, HubPolicy, SessionPolicy};
pub use relay::{spawn_pair, CallerEvent, ChannelPair, PairLink};
pub use request::{BackendRequest, CallerRequest};
pub use server::{load_host_key, server_config, ProxyServer};
pub use session::{ConnectionSession, Route, SessionState};

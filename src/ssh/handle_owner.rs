//! Backend Handle Owner Task
//!
//! Only one task owns the outbound `Handle<BackendHandler>`. The connection's
//! handler talks to it through a `HandleController`, which sends commands over
//! an mpsc channel.
//!
//! The backend session lives exactly as long as its controllers: when the
//! last `HandleController` is dropped (the inbound connection went away) the
//! owner task disconnects the backend and exits.
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, conn_id);
//! let channel = controller.open_channel(ChannelKind::Session).await?;
//! ```

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::BackendHandler;
use super::error::ProxyError;

/// Channel types the proxy knows how to mirror on the backend, together with
/// the extra data carried by the open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
    },
}

impl ChannelKind {
    /// Wire name of the channel type
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a channel of the given kind
    OpenChannel {
        kind: ChannelKind,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the Sender). Every clone keeps the backend session
/// alive; drop all of them to release it.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Create a controller over an arbitrary command channel.
    ///
    /// Used by tests and by alternative connectors; production code goes
    /// through `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a backend channel mirroring an inbound channel open
    pub async fn open_channel(&self, kind: ChannelKind) -> Result<Channel<Msg>, ProxyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenChannel { kind, reply_tx })
            .await
            .map_err(|_| ProxyError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| ProxyError::Disconnected)?
            .map_err(|e| ProxyError::ChannelError(e.to_string()))
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the backend Handle and returns a controller for sending commands.
pub fn spawn_handle_owner_task(handle: Handle<BackendHandler>, conn_id: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(16);

    tokio::spawn(async move {
        debug!(conn_id = %conn_id, "Backend handle owner task started");

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::OpenChannel { kind, reply_tx } => {
                    let result = match &kind {
                        ChannelKind::Session => handle.channel_open_session().await,
                        ChannelKind::DirectTcpip {
                            host,
                            port,
                            originator_host,
                            originator_port,
                        } => {
                            handle
                                .channel_open_direct_tcpip(
                                    host.as_str(),
                                    *port,
                                    originator_host.as_str(),
                                    *originator_port,
                                )
                                .await
                        }
                    };
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped here; the backend closes it
                        warn!(
                            conn_id = %conn_id,
                            "Caller dropped before receiving {} channel",
                            kind.type_name()
                        );
                    }
                }
            }
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!(conn_id = %conn_id, "Backend session released");
    });

    HandleController { cmd_tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_type_names() {
        assert_eq!(ChannelKind::Session.type_name(), "session");
        let tcpip = ChannelKind::DirectTcpip {
            host: "localhost".into(),
            port: 8888,
            originator_host: "127.0.0.1".into(),
            originator_port: 50000,
        };
        assert_eq!(tcpip.type_name(), "direct-tcpip");
    }

    #[tokio::test]
    async fn test_open_channel_after_owner_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        drop(cmd_rx);
        let controller = HandleController::new(cmd_tx);

        let result = controller.open_channel(ChannelKind::Session).await;
        assert!(matches!(result, Err(ProxyError::Disconnected)));
    }

    #[tokio::test]
    async fn test_open_channel_error_is_channel_error() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let controller = HandleController::new(cmd_tx);

        tokio::spawn(async move {
            if let Some(HandleCommand::OpenChannel { kind, reply_tx }) = cmd_rx.recv().await {
                assert_eq!(kind, ChannelKind::Session);
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
        });

        let result = controller.open_channel(ChannelKind::Session).await;
        assert!(matches!(result, Err(ProxyError::ChannelError(_))));
    }
}

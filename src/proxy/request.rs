//! Channel control requests
//!
//! russh surfaces channel requests as typed callbacks (caller side) and
//! `ChannelMsg` variants (backend side) rather than raw (type, payload)
//! pairs, so forwarding is a mapping from what one side delivered to the
//! matching call on the other.

use russh::client::Msg as ClientMsg;
use russh::server::Handle as ServerHandle;
use russh::{ChannelId, ChannelMsg, ChannelWriteHalf, Pty, Sig};

use crate::ssh::ProxyError;

/// Request received from the caller, to be replayed on the backend channel
#[derive(Debug, Clone)]
pub enum CallerRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Env {
        name: String,
        value: String,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        signal: Sig,
    },
    X11 {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen_number: u32,
    },
    AgentForward,
}

/// Terminal modes as they may be re-encoded.
///
/// russh's server pads the modes with `TTY_OP_END`, and its client counts
/// every entry in the length prefix but skips `TTY_OP_END` in the body, so a
/// padded list produces a malformed `pty-req`.
pub fn wire_modes(modes: &[(Pty, u32)]) -> Vec<(Pty, u32)> {
    modes
        .iter()
        .copied()
        .filter(|(code, _)| *code != Pty::TTY_OP_END)
        .collect()
}

impl CallerRequest {
    /// SSH request type name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pty { .. } => "pty-req",
            Self::Shell => "shell",
            Self::Env { .. } => "env",
            Self::Subsystem { .. } => "subsystem",
            Self::WindowChange { .. } => "window-change",
            Self::Signal { .. } => "signal",
            Self::X11 { .. } => "x11-req",
            Self::AgentForward => "auth-agent-req@openssh.com",
        }
    }

    /// `window-change` and `signal` never carry want_reply
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::WindowChange { .. } | Self::Signal { .. })
    }

    /// Replay the request on the backend channel
    pub async fn forward(
        self,
        want_reply: bool,
        backend: &ChannelWriteHalf<ClientMsg>,
    ) -> Result<(), ProxyError> {
        match self {
            Self::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                backend
                    .request_pty(
                        want_reply,
                        &term,
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                        &wire_modes(&modes),
                    )
                    .await?
            }
            Self::Shell => backend.request_shell(want_reply).await?,
            Self::Env { name, value } => backend.set_env(want_reply, name, value).await?,
            Self::Subsystem { name } => backend.request_subsystem(want_reply, name).await?,
            Self::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                backend
                    .window_change(col_width, row_height, pix_width, pix_height)
                    .await?
            }
            Self::Signal { signal } => backend.signal(signal).await?,
            Self::X11 {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen_number,
            } => {
                backend
                    .request_x11(
                        want_reply,
                        single_connection,
                        auth_protocol,
                        auth_cookie,
                        screen_number,
                    )
                    .await?
            }
            Self::AgentForward => backend.agent_forward(want_reply).await?,
        }
        Ok(())
    }
}

/// Request received from the backend, to be replayed to the caller
#[derive(Debug, Clone)]
pub enum BackendRequest {
    ExitStatus(u32),
    ExitSignal {
        signal: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    XonXoff(bool),
}

impl BackendRequest {
    pub fn from_msg(msg: &ChannelMsg) -> Option<Self> {
        let parsed = match msg {
            ChannelMsg::ExitStatus { exit_status } => Self::ExitStatus(*exit_status),
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => Self::ExitSignal {
                signal: signal_name.clone(),
                core_dumped: *core_dumped,
                error_message: error_message.clone(),
                lang_tag: lang_tag.clone(),
            },
            ChannelMsg::XonXoff { client_can_do } => Self::XonXoff(*client_can_do),
            _ => return None,
        };
        Some(parsed)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExitStatus(_) => "exit-status",
            Self::ExitSignal { .. } => "exit-signal",
            Self::XonXoff(_) => "xon-xoff",
        }
    }

    /// `exit-status` and `exit-signal` both end the command
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::ExitStatus(_) | Self::ExitSignal { .. })
    }

    /// Replay on the caller's channel `id`
    pub async fn forward(self, caller: &ServerHandle, id: ChannelId) -> Result<(), ProxyError> {
        let kind = self.kind();
        let sent = match self {
            Self::ExitStatus(status) => caller.exit_status_request(id, status).await,
            Self::ExitSignal {
                signal,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                caller
                    .exit_signal_request(id, signal, core_dumped, error_message, lang_tag)
                    .await
            }
            Self::XonXoff(client_can_do) => caller.xon_xoff_request(id, client_can_do).await,
        };
        sent.map_err(|_| {
            ProxyError::RelayError(format!("Caller session gone while sending {}", kind))
        })
    }
}

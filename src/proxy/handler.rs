//! Inbound SSH handler
//!
//! One `ProxyHandler` per accepted connection. Authentication runs in two
//! steps against the [`SessionPolicy`]:
//!
//! 1. The first auth request naming a user resolves that user's route and
//!    builds the status banner. OpenSSH always starts with `none`, so this
//!    normally happens before any prompt is shown.
//! 2. The password (sent through `password` or as the answer to the
//!    keyboard-interactive prompt that carries the banner) is verified, and
//!    only then is the backend session opened with the service account.
//!
//! Every accepted channel open is mirrored on the backend and handed to a
//! [`ChannelPair`]. Data, EOF and close reach the pair through its
//! [`PairLink`]. Channel requests are forwarded from their callbacks, and the
//! caller gets the backend's answer once it arrives.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use tracing::{debug, error, info, warn};

use super::filter::StreamFilter;
use super::policy::SessionPolicy;
use super::relay::{spawn_pair, CallerEvent, ChannelPair, PairLink};
use super::request::CallerRequest;
use super::session::{ConnectionSession, SessionState};
use crate::ssh::{BackendConnector, ChannelKind, ProxyError};

/// Greeting sent before authentication starts
const WELCOME: &str = "Welcome to JupyterHub SSH Client!\n";

/// Prompt carried by the keyboard-interactive request
const PASSWORD_PROMPT: &str = "Password: ";

/// Read-only state shared by every connection
pub struct ProxyContext {
    pub policy: Arc<dyn SessionPolicy>,
    pub connector: Arc<dyn BackendConnector>,
    /// Backend-to-caller transform
    pub filter: Arc<dyn StreamFilter>,
    /// Concurrent channels allowed per connection
    pub max_channels: Option<usize>,
}

pub struct ProxyHandler {
    ctx: Arc<ProxyContext>,
    session: ConnectionSession,
    pairs: HashMap<ChannelId, PairLink>,
}

impl ProxyHandler {
    pub fn new(ctx: Arc<ProxyContext>, session: ConnectionSession) -> Self {
        Self {
            ctx,
            session,
            pairs: HashMap::new(),
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    fn retry_methods() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                &[MethodKind::KeyboardInteractive, MethodKind::Password][..],
            )),
            partial_success: false,
        }
    }

    /// Route lookup for `user`, once per username
    async fn ensure_route(&mut self, user: &str) {
        if self.session.is_routed_for(user) {
            return;
        }

        if let Some(previous) = self.session.username() {
            debug!(
                conn_id = %self.session.conn_id,
                "Username changed from {} to {}, resolving again",
                previous,
                user
            );
        }

        let route = self.ctx.policy.resolve_route(user).await;
        let banner = self.ctx.policy.banner(user, route.as_ref());

        match &route {
            Some(route) => info!(
                conn_id = %self.session.conn_id,
                user = %user,
                "Route resolved to {}",
                route
            ),
            None => info!(conn_id = %self.session.conn_id, user = %user, "No route found"),
        }

        self.session.set_route(user, route, banner);
    }

    /// Verify the credential and, if it is good and a route exists, open the
    /// backend session with the service account
    async fn authenticate(&mut self, user: &str, credential: &str) -> Result<Auth, ProxyError> {
        self.ensure_route(user).await;

        if !self.ctx.policy.verify_credential(user, credential).await {
            info!(conn_id = %self.session.conn_id, user = %user, "Credential rejected");
            return Ok(Self::retry_methods());
        }

        let Some(route) = self.session.route().cloned() else {
            info!(
                conn_id = %self.session.conn_id,
                user = %user,
                "Credential accepted but no backend is running"
            );
            return Ok(Self::retry_methods());
        };

        let backend = match self
            .ctx
            .connector
            .connect(route.socket_addr(), &self.session.conn_id)
            .await
        {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    conn_id = %self.session.conn_id,
                    user = %user,
                    "Backend session to {} failed: {}",
                    route,
                    e
                );
                self.session.close();
                return Err(e);
            }
        };

        self.session.attach_backend(backend);
        info!(conn_id = %self.session.conn_id, user = %user, "Authenticated, backend {}", route);
        Ok(Auth::Accept)
    }

    /// Mirror an inbound channel on the backend and start relaying it
    async fn open_pair(
        &mut self,
        kind: ChannelKind,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, ProxyError> {
        let Some(backend) = self.session.backend().cloned() else {
            warn!(conn_id = %self.session.conn_id, "Channel open before authentication");
            return Ok(false);
        };

        self.pairs.retain(|_, link| !link.is_finished());
        if let Some(max) = self.ctx.max_channels {
            if self.pairs.len() >= max {
                warn!(
                    conn_id = %self.session.conn_id,
                    "Refusing {} channel: {} channels already open",
                    kind.type_name(),
                    max
                );
                return Ok(false);
            }
        }

        let outbound = match backend.open_channel(kind.clone()).await {
            Ok(outbound) => outbound,
            Err(e) => {
                error!(
                    conn_id = %self.session.conn_id,
                    "Backend refused {} channel, closing connection: {}",
                    kind.type_name(),
                    e
                );
                self.session.close();
                return Err(e);
            }
        };

        let id = channel.id();
        let key = self.session.register_channel();
        debug!(
            conn_id = %self.session.conn_id,
            pair = key,
            "Opened {} channel pair",
            kind.type_name()
        );

        let link = spawn_pair(ChannelPair {
            conn_id: self.session.conn_id.clone(),
            key,
            inbound: channel,
            outbound,
            caller: session.handle(),
            filter: self.ctx.filter.clone(),
            cancel: self.session.cancel_token().child_token(),
        });
        self.pairs.insert(id, link);

        Ok(true)
    }

    /// Hand caller data or EOF to the pair serving `channel`
    fn pass_on(&self, channel: ChannelId, event: CallerEvent) {
        let Some(link) = self.pairs.get(&channel) else {
            debug!(conn_id = %self.session.conn_id, "{:?} on unknown channel {:?}", event, channel);
            return;
        };
        if !link.send(event) {
            debug!(conn_id = %self.session.conn_id, pair = link.key, "Pair already ended");
        }
    }

    /// Forward a channel request and answer the caller with the backend's
    /// verdict
    async fn relay_request(
        &mut self,
        channel: ChannelId,
        request: CallerRequest,
        session: &mut Session,
    ) -> Result<(), ProxyError> {
        let kind = request.kind();
        let accepted = match self.pairs.get(&channel) {
            Some(link) => match link.forward(request).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(
                        conn_id = %self.session.conn_id,
                        pair = link.key,
                        "Forwarding {} failed: {}",
                        kind,
                        e
                    );
                    false
                }
            },
            None => false,
        };

        debug!(
            conn_id = %self.session.conn_id,
            "{} on {:?} {}",
            kind,
            channel,
            if accepted { "accepted" } else { "refused" }
        );
        // Both are no-ops when the caller did not ask for a reply
        if accepted {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }
}

impl Handler for ProxyHandler {
    type Error = ProxyError;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(Some(WELCOME.to_string()))
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.ensure_route(user).await;
        Ok(Self::retry_methods())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.ensure_route(user).await;
        if let Some(banner) = self.session.banner() {
            debug!(conn_id = %self.session.conn_id, "Status for password client: {:?}", banner);
        }
        self.authenticate(user, password).await
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        let Some(response) = response else {
            self.ensure_route(user).await;
            let instructions = self.session.banner().unwrap_or_default().to_string();
            return Ok(Auth::Partial {
                name: "".into(),
                instructions: instructions.into(),
                prompts: vec![(PASSWORD_PROMPT.into(), false)].into(),
            });
        };

        let Some(password) = response
            .into_iter()
            .next()
            .map(|r| String::from_utf8_lossy(&r).to_string())
        else {
            return Ok(Self::retry_methods());
        };

        self.authenticate(user, &password).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.open_pair(ChannelKind::Session, channel, session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let kind = ChannelKind::DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_host: originator_address.to_string(),
            originator_port,
        };
        self.open_pair(kind, channel, session).await
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pass_on(channel, CallerEvent::Data(Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            conn_id = %self.session.conn_id,
            "Dropping {} bytes of extended data type {} from caller on {:?}",
            data.len(),
            code,
            channel
        );
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pass_on(channel, CallerEvent::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(link) = self.pairs.remove(&channel) {
            link.send(CallerEvent::Close);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = CallerRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.relay_request(channel, request, session).await
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = CallerRequest::X11 {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen_number: x11_screen_number,
        };
        self.relay_request(channel, request, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = CallerRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.relay_request(channel, request, session).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(channel, CallerRequest::Shell, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            conn_id = %self.session.conn_id,
            "Refusing exec request: {}",
            String::from_utf8_lossy(data)
        );
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = CallerRequest::Subsystem {
            name: name.to_string(),
        };
        self.relay_request(channel, request, session).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = CallerRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        };
        self.relay_request(channel, request, session).await
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.relay_request(channel, CallerRequest::AgentForward, session)
            .await?;
        // The channel reply is already out; `false` would add a global REQUEST_FAILURE
        Ok(true)
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(channel, CallerRequest::Signal { signal }, session)
            .await
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            conn_id = %self.session.conn_id,
            "Rejecting tcpip-forward for {}:{}",
            address,
            port
        );
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            conn_id = %self.session.conn_id,
            "Rejecting cancel-tcpip-forward for {}:{}",
            address,
            port
        );
        Ok(false)
    }
}

impl Drop for ProxyHandler {
    fn drop(&mut self) {
        if self.session.state() != SessionState::Closed {
            self.session.close();
        }
        debug!(
            conn_id = %self.session.conn_id,
            "Connection state released ({} channels)",
            self.session.channels_opened()
        );
    }
}

//! The per-connection SSH handler: authentication callbacks, channel
//! bookkeeping, and dispatch into the session handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hatchway_core::config::AuthMode;
use hatchway_core::login::{self, LoginIdentity};

use crate::app::Gateway;
use crate::auth::Authenticator;
use crate::session::shell::{ChannelSetup, PtyParams};
use crate::session::tcpip::ReverseForward;
use crate::session::{exit, sftp, shell, tcpip, SessionCtx};

pub struct ConnectionHandler {
    gw: Arc<Gateway>,
    peer: Option<SocketAddr>,
    /// Short id, logged everywhere and exported as `SSH_SESSION`.
    session_id: String,
    identity: Option<Arc<LoginIdentity>>,
    ctx: Option<Arc<SessionCtx>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    setups: HashMap<ChannelId, ChannelSetup>,
    resizers: HashMap<ChannelId, mpsc::Sender<(u32, u32)>>,
    /// Reverse forwards keyed by `bind-addr:bind-port`.
    forwards: HashMap<String, ReverseForward>,
}

impl ConnectionHandler {
    pub fn new(gw: Arc<Gateway>, peer: Option<SocketAddr>) -> Self {
        let session_id = format!("{:08x}", rand::thread_rng().gen::<u32>());
        debug!(session = %session_id, ?peer, "connection opened");
        Self {
            gw,
            peer,
            session_id,
            identity: None,
            ctx: None,
            channels: HashMap::new(),
            setups: HashMap::new(),
            resizers: HashMap::new(),
            forwards: HashMap::new(),
        }
    }

    /// Parse (once) the login identity out of the SSH username.
    fn identity_for(&mut self, user: &str) -> Arc<LoginIdentity> {
        if let Some(identity) = &self.identity {
            if identity.orig_user == user {
                return identity.clone();
            }
        }
        let identity = Arc::new(login::parse(user, &self.gw.config.default_remote));
        self.identity = Some(identity.clone());
        identity
    }

    fn bind_key(&mut self, fingerprint: String) {
        if let Some(identity) = &self.identity {
            let mut bound = (**identity).clone();
            bound.public_key = Some(fingerprint);
            self.identity = Some(Arc::new(bound));
        }
    }

    /// The session context, created on first use after authentication.
    fn ctx(&mut self) -> Option<Arc<SessionCtx>> {
        if self.ctx.is_none() {
            let identity = self.identity.clone()?;
            self.ctx = Some(SessionCtx::new(
                self.gw.clone(),
                self.session_id.clone(),
                self.peer,
                identity,
            ));
        }
        self.ctx.clone()
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Hand a session channel over to its handler task.
    fn spawn_session(
        &mut self,
        id: ChannelId,
        raw_command: Option<String>,
        session: &mut Session,
    ) -> Result<bool, anyhow::Error> {
        let Some(channel) = self.channels.remove(&id) else {
            return Ok(false);
        };
        let Some(ctx) = self.ctx() else {
            return Ok(false);
        };
        let setup = self.setups.remove(&id).unwrap_or_default();
        let (resize_tx, resize_rx) = mpsc::channel(16);
        self.resizers.insert(id, resize_tx);
        let handle = session.handle();
        tokio::spawn(shell::run(ctx, channel, handle, setup, raw_command, resize_rx));
        Ok(true)
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let identity = self.identity_for(user);
        if self.gw.config.auth == AuthMode::Noauth && identity.command.is_none() {
            debug!(session = %self.session_id, user, "noauth: none accepted");
            return Ok(Auth::Accept);
        }
        Ok(Self::reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let identity = self.identity_for(user);
        let authenticator = Authenticator::new(self.gw.clone());
        match authenticator
            .check_publickey(&identity, key, &self.session_id)
            .await
        {
            Some(fingerprint) => {
                info!(session = %self.session_id, user, key = %fingerprint, "publickey accepted");
                self.bind_key(fingerprint);
                Ok(Auth::Accept)
            }
            None => {
                info!(session = %self.session_id, user, "publickey rejected");
                Ok(Self::reject())
            }
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let identity = self.identity_for(user);
        let authenticator = Authenticator::new(self.gw.clone());
        if authenticator
            .check_password(&identity, password, &self.session_id)
            .await
        {
            info!(session = %self.session_id, user, "password accepted");
            Ok(Auth::Accept)
        } else {
            info!(session = %self.session_id, user, "password rejected");
            Ok(Self::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(session = %self.session_id, channel = %channel.id(), "session channel");
        self.setups.insert(channel.id(), ChannelSetup::default());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            session = %self.session_id,
            dest = host_to_connect,
            port = port_to_connect,
            origin = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip"
        );
        let Some(ctx) = self.ctx() else {
            return Ok(false);
        };
        tokio::spawn(tcpip::run_direct(
            ctx,
            channel,
            host_to_connect.to_string(),
            port_to_connect,
        ));
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(setup) = self.setups.get_mut(&channel) {
            setup
                .env
                .insert(variable_name.to_string(), variable_value.to_string());
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(session = %self.session_id, term, cols = col_width, rows = row_height, "pty requested");
        if let Some(setup) = self.setups.get_mut(&channel) {
            setup.pty = Some(PtyParams {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            });
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(resizer) = self.resizers.get(&channel) {
            // Best effort: a full queue or a finished session drops the
            // event rather than blocking the connection.
            if resizer.try_send((col_width, row_height)).is_err() {
                debug!(session = %self.session_id, "window change dropped");
            }
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(session = %self.session_id, "agent forwarding requested");
        if let Some(setup) = self.setups.get_mut(&channel) {
            setup.agent = true;
        }
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.spawn_session(channel, None, session)? {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).to_string();
        debug!(session = %self.session_id, command = %raw, "exec requested");
        if self.spawn_session(channel, Some(raw), session)? {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            warn!(session = %self.session_id, subsystem = name, "unsupported subsystem");
            let handle = session.handle();
            let line = format!("subsystem {name} is not supported\r\n");
            let _ = handle
                .extended_data(channel, 1, CryptoVec::from_slice(line.as_bytes()))
                .await;
            let _ = handle.exit_status_request(channel, exit::NOT_IMPLEMENTED).await;
            session.channel_failure(channel)?;
            return Ok(());
        }
        let Some(chan) = self.channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        let Some(ctx) = self.ctx() else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        self.setups.remove(&channel);
        tokio::spawn(sftp::run(ctx, chan, session.handle()));
        session.channel_success(channel)?;
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(ctx) = self.ctx() else {
            return Ok(false);
        };
        if let Err(failure) = ctx.validate_login().await {
            debug!(session = %self.session_id, reason = %failure.message, "tcpip-forward rejected");
            return Ok(false);
        }
        if *port == 0 {
            *port = rand::thread_rng().gen_range(32768..61000);
        }
        let bind_addr = if address.is_empty() {
            "0.0.0.0".to_string()
        } else {
            address.to_string()
        };
        let key = format!("{bind_addr}:{port}");
        if self.forwards.contains_key(&key) {
            debug!(session = %self.session_id, %key, "duplicate tcpip-forward");
            return Ok(false);
        }
        let bind = format!("{bind_addr}:{port}");
        let (device, listener) = match ctx
            .gw
            .devices
            .add_reverse_port(&ctx.client, &ctx.identity.instance, &bind)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                warn!(session = %self.session_id, %bind, error = %e, "reverse device failed");
                return Ok(false);
            }
        };
        ctx.adopt_device(device.clone()).await;

        let cancel = ctx.cancel.child_token();
        tokio::spawn(tcpip::run_reverse_accepts(
            ctx.clone(),
            listener,
            session.handle(),
            bind_addr,
            *port,
            cancel.clone(),
        ));
        self.forwards.insert(key, ReverseForward { device, cancel });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let bind_addr = if address.is_empty() {
            "0.0.0.0".to_string()
        } else {
            address.to_string()
        };
        let key = format!("{bind_addr}:{port}");
        match self.forwards.remove(&key) {
            Some(forward) => {
                debug!(session = %self.session_id, %key, "cancelling reverse forward");
                if let Some(ctx) = &self.ctx {
                    forward.shutdown(ctx).await;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Channels that were handed to a task see EOF through it; only
        // untouched ones need closing here.
        if self.channels.remove(&channel).is_some() {
            session.close(channel)?;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        self.setups.remove(&channel);
        self.resizers.remove(&channel);
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!(session = %self.session_id, "connection closed");
        let ctx = self.ctx.take();
        let forwards: Vec<ReverseForward> = self.forwards.drain().map(|(_, f)| f).collect();
        if ctx.is_none() && forwards.is_empty() {
            return;
        }
        // Cleanup needs async; the connection task is gone, so detach it.
        tokio::spawn(async move {
            if let Some(ctx) = ctx {
                ctx.cancel.cancel();
                for forward in forwards {
                    forward.shutdown(&ctx).await;
                }
                ctx.shutdown_devices().await;
            }
        });
    }
}

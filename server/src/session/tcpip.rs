//! TCP forwarding: `direct-tcpip` channels and reverse (`tcpip-forward`)
//! listeners.

use std::sync::Arc;

use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hatchway_core::config::ForwardStrategy;
use hatchway_core::incus::exec::{self, ExecOptions};
use hatchway_core::incus::files;

use crate::devices::ProxyDevice;
use crate::guestbin::GuestTool;
use crate::session::SessionCtx;

/// Serve one `direct-tcpip` channel.
///
/// Destinations matching the instance's primary address are dialed from
/// the host; anything else is only reachable from inside the instance and
/// goes through a transient port proxy device or the stdio-proxy helper,
/// depending on configuration.
pub async fn run_direct(
    ctx: Arc<SessionCtx>,
    channel: Channel<Msg>,
    dest_addr: String,
    dest_port: u32,
) {
    if let Err(failure) = ctx.validate_login().await {
        debug!(session = %ctx.session_id, reason = %failure.message, "direct-tcpip rejected");
        return;
    }

    let instance_addr = ctx.instance_address().await;
    let dest_addr = if dest_addr.is_empty() {
        match &instance_addr {
            Some(addr) => addr.clone(),
            None => {
                warn!(session = %ctx.session_id, "no instance address to forward to");
                return;
            }
        }
    } else {
        dest_addr
    };

    if Some(&dest_addr) == instance_addr.as_ref() {
        match TcpStream::connect((dest_addr.as_str(), dest_port as u16)).await {
            Ok(mut outbound) => {
                debug!(session = %ctx.session_id, dest = %dest_addr, port = dest_port, "forwarding directly");
                let mut stream = channel.into_stream();
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut outbound).await;
            }
            Err(e) => {
                debug!(session = %ctx.session_id, dest = %dest_addr, port = dest_port, error = %e, "dial failed");
            }
        }
        return;
    }

    match ctx.gw.config.forward_strategy {
        ForwardStrategy::Proxy => forward_via_device(ctx, channel, &dest_addr, dest_port).await,
        ForwardStrategy::Stdio => forward_via_stdio(ctx, channel, &dest_addr, dest_port).await,
    }
}

/// Bridge through a transient host-bound port proxy device.
async fn forward_via_device(
    ctx: Arc<SessionCtx>,
    channel: Channel<Msg>,
    dest_addr: &str,
    dest_port: u32,
) {
    let source = format!("{dest_addr}:{dest_port}");
    let device = match ctx
        .gw
        .devices
        .add_port(&ctx.client, &ctx.identity.instance, &source)
        .await
    {
        Ok(device) => device,
        Err(e) => {
            warn!(session = %ctx.session_id, dest = %source, error = %e, "port device failed");
            return;
        }
    };
    ctx.adopt_device(device.clone()).await;

    match TcpStream::connect(device.target.as_str()).await {
        Ok(mut outbound) => {
            debug!(session = %ctx.session_id, dest = %source, via = %device.target, "forwarding via proxy device");
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut outbound).await;
        }
        Err(e) => {
            warn!(session = %ctx.session_id, via = %device.target, error = %e, "cannot dial proxy device");
        }
    }

    if let Err(e) = device.shutdown().await {
        warn!(session = %ctx.session_id, device = %device.id, error = %e, "device teardown failed");
    }
    ctx.gw.registry().remove(&device.id);
}

/// Bridge by running the stdio-proxy helper inside the instance.
async fn forward_via_stdio(
    ctx: Arc<SessionCtx>,
    channel: Channel<Msg>,
    dest_addr: &str,
    dest_port: u32,
) {
    let instance = match ctx.client.get_instance(&ctx.identity.instance).await {
        Ok(instance) => instance,
        Err(e) => {
            warn!(session = %ctx.session_id, error = %e, "cannot read instance");
            return;
        }
    };
    let binary = match ctx.gw.guest.resolve(GuestTool::StdioProxy, instance.arch()) {
        Ok(binary) => binary,
        Err(e) => {
            warn!(session = %ctx.session_id, error = %e, "no stdio-proxy helper for instance");
            return;
        }
    };
    let remote_path = GuestTool::StdioProxy.remote_path();
    match files::file_exists(&ctx.client, &ctx.identity.instance, remote_path, &binary.md5_hex)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            if let Err(e) = files::push_file(
                &ctx.client,
                &ctx.identity.instance,
                remote_path,
                binary.bytes.clone(),
                0,
                0,
                0o755,
            )
            .await
            {
                warn!(session = %ctx.session_id, error = %e, "stdio-proxy upload failed");
                return;
            }
        }
        Err(e) => {
            warn!(session = %ctx.session_id, error = %e, "stdio-proxy probe failed");
            return;
        }
    }

    let opts = ExecOptions::new(vec![
        remote_path.to_string(),
        format!("tcp:{dest_addr}:{dest_port}"),
    ]);
    debug!(session = %ctx.session_id, dest = %dest_addr, port = dest_port, "forwarding via stdio-proxy");

    let cancel = ctx.cancel.child_token();
    let (stdin, stdout, stderr) = super::shell::channel_streams(channel, cancel.clone());
    let result = exec::exec(
        &ctx.client,
        &ctx.identity.instance,
        opts,
        stdin,
        stdout,
        stderr,
        None,
        cancel.clone(),
    )
    .await;
    cancel.cancel();
    if let Err(e) = result {
        debug!(session = %ctx.session_id, error = %e, "stdio-proxy ended");
    }
}

/// A live reverse forward, tracked per `bind:port` for cancellation.
pub struct ReverseForward {
    pub device: Arc<ProxyDevice>,
    pub cancel: CancellationToken,
}

impl ReverseForward {
    /// Close the listener and remove the device.
    pub async fn shutdown(&self, ctx: &SessionCtx) {
        self.cancel.cancel();
        if let Err(e) = self.device.shutdown().await {
            warn!(device = %self.device.id, error = %e, "reverse device teardown failed");
        }
        ctx.gw.registry().remove(&self.device.id);
    }
}

/// Accept loop for a reverse forward's host-side listener.
///
/// Every connection the instance-side listener receives is tunneled to
/// `listener`; each accept opens a `forwarded-tcpip` channel back to the
/// SSH client carrying the original bind address and the peer's origin.
pub async fn run_reverse_accepts(
    ctx: Arc<SessionCtx>,
    listener: TcpListener,
    handle: Handle,
    bind_addr: String,
    bind_port: u32,
    cancel: CancellationToken,
) {
    info!(
        session = %ctx.session_id,
        bind = %bind_addr,
        port = bind_port,
        "reverse forward listening"
    );
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (conn, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                debug!(session = %ctx.session_id, error = %e, "reverse accept failed");
                break;
            }
        };
        let channel = match handle
            .channel_open_forwarded_tcpip(
                bind_addr.clone(),
                bind_port,
                peer.ip().to_string(),
                peer.port() as u32,
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                debug!(session = %ctx.session_id, error = %e, "client refused forwarded-tcpip");
                continue;
            }
        };
        tokio::spawn(async move {
            let mut conn = conn;
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut conn, &mut stream).await;
        });
    }
    debug!(session = %ctx.session_id, bind = %bind_addr, port = bind_port, "reverse forward closed");
}

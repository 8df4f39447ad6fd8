//! SSH server assembly: host key, russh configuration, and the two ways
//! of serving (daemon accept loop, single inherited connection).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::Server as _;
use russh::{MethodKind, MethodSet, SshId};
use tracing::{info, warn};

use hatchway_core::config::AuthMode;

use crate::app::Gateway;
use crate::handler::ConnectionHandler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const HOST_KEY_FILE: &str = "hatchway_host_ed25519";

/// Load the persisted host key, generating one on first start.
pub fn load_or_generate_host_key(dir: &Path) -> anyhow::Result<PrivateKey> {
    let path = dir.join(HOST_KEY_FILE);
    if path.exists() {
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read host key {}", path.display()))?;
        return PrivateKey::from_openssh(&data)
            .with_context(|| format!("cannot parse host key {}", path.display()));
    }
    info!(path = %path.display(), "generating host key");
    let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)?;
    std::fs::create_dir_all(dir)?;
    let pem = key.to_openssh(LineEnding::LF)?;
    std::fs::write(&path, pem.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(key)
}

/// russh server configuration shared by both serving modes.
pub fn make_config(gw: &Gateway, host_key: PrivateKey) -> russh::server::Config {
    let mut kinds = vec![MethodKind::PublicKey];
    if gw.config.password_auth {
        kinds.push(MethodKind::Password);
    }
    if gw.config.auth == AuthMode::Noauth {
        kinds.push(MethodKind::None);
    }
    russh::server::Config {
        server_id: SshId::Standard(format!("SSH-2.0-hatchway_{VERSION}")),
        keys: vec![host_key],
        methods: MethodSet::from(&kinds[..]),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: Some(Duration::from_secs(3600)),
        keepalive_interval: Some(Duration::from_secs(20)),
        keepalive_max: 3,
        ..Default::default()
    }
}

/// Normalize a `addr:port` / `:port` listen string.
pub fn listen_addr(listen: &str) -> String {
    match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    }
}

pub struct GatewayServer {
    gw: Arc<Gateway>,
}

impl GatewayServer {
    pub fn new(gw: Arc<Gateway>) -> Self {
        Self { gw }
    }
}

impl russh::server::Server for GatewayServer {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer: Option<std::net::SocketAddr>) -> ConnectionHandler {
        ConnectionHandler::new(self.gw.clone(), peer)
    }

    fn handle_session_error(&mut self, error: anyhow::Error) {
        warn!(error = %error, "session ended with error");
    }
}

/// Daemon mode: serve until the gateway's shutdown token fires, then
/// drain devices with a bounded timeout.
pub async fn run_daemon(gw: Arc<Gateway>, host_key: PrivateKey) -> anyhow::Result<()> {
    let addr = listen_addr(&gw.config.listen);
    let config = Arc::new(make_config(&gw, host_key));
    let mut server = GatewayServer::new(gw.clone());
    info!(%addr, "listening");

    tokio::select! {
        result = server.run_on_address(config, addr.as_str()) => {
            result.context("ssh server failed")?;
        }
        _ = gw.shutdown.cancelled() => {
            info!("shutdown requested");
        }
    }
    graceful_drain(&gw).await;
    Ok(())
}

/// Serve exactly one connection handed down as an inherited fd
/// (master-mode child).
pub async fn run_single(
    gw: Arc<Gateway>,
    host_key: PrivateKey,
    fd: std::os::unix::io::RawFd,
) -> anyhow::Result<()> {
    use std::os::unix::io::FromRawFd;
    // Safety: the parent put a connected TCP socket at this fd and we are
    // its only owner.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .context("cannot set inherited socket non-blocking")?;
    let stream = tokio::net::TcpStream::from_std(std_stream)?;
    let peer = stream.peer_addr().ok();
    info!(?peer, "serving inherited connection");

    let config = Arc::new(make_config(&gw, host_key));
    let handler = ConnectionHandler::new(gw.clone(), peer);
    let session = russh::server::run_stream(config, stream, handler)
        .await
        .context("ssh handshake failed")?;
    tokio::select! {
        result = session => {
            if let Err(e) = result {
                warn!(error = %e, "connection ended with error");
            }
        }
        _ = gw.shutdown.cancelled() => {}
    }
    graceful_drain(&gw).await;
    Ok(())
}

/// Phase one of shutdown: devices, bounded to five seconds.
async fn graceful_drain(gw: &Gateway) {
    let deadline = tokio_util::sync::CancellationToken::new();
    let timer = deadline.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        timer.cancel();
    });
    gw.registry().shutdown_all(&deadline).await;
    if !gw.registry().is_empty() {
        warn!(remaining = gw.registry().len(), "devices left after drain");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_normalization() {
        assert_eq!(listen_addr(":2222"), "0.0.0.0:2222");
        assert_eq!(listen_addr("127.0.0.1:2022"), "127.0.0.1:2022");
    }

    #[test]
    fn host_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let generated = load_or_generate_host_key(dir.path()).unwrap();
        let reloaded = load_or_generate_host_key(dir.path()).unwrap();
        assert_eq!(
            generated.public_key().to_openssh().unwrap(),
            reloaded.public_key().to_openssh().unwrap()
        );
    }
}

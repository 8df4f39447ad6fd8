//! Per-connection session context and the channel handler entry points.

pub mod commands;
pub mod sftp;
pub mod shell;
pub mod tcpip;

use std::sync::Arc;

use russh::server::Handle;
use russh::ChannelId;
use russh::CryptoVec;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hatchway_core::incus::Client;
use hatchway_core::instance_user::InstanceUser;
use hatchway_core::login::LoginIdentity;

use crate::app::Gateway;
use crate::devices::ProxyDevice;

/// Exit codes surfaced to SSH clients.
pub mod exit {
    /// Unsupported subsystem or request.
    pub const NOT_IMPLEMENTED: u32 = 127;
    /// The login string is invalid or the instance user is missing.
    pub const INVALID_LOGIN: u32 = 1;
    /// The named project does not exist.
    pub const INVALID_PROJECT: u32 = 2;
    /// Instance metadata could not be read.
    pub const META: u32 = 3;
    /// Unsupported instance architecture.
    pub const ARCH: u32 = 4;
    /// Internal server error.
    pub const INTERNAL: u32 = 20;
    /// The instance manager is unreachable or rejected us.
    pub const BACKEND: u32 = 255;
}

/// State carried for the lifetime of one SSH connection.
pub struct SessionCtx {
    pub gw: Arc<Gateway>,
    /// Short id used in logs and exported as `SSH_SESSION`.
    pub session_id: String,
    pub peer: Option<std::net::SocketAddr>,
    pub identity: Arc<LoginIdentity>,
    /// Client bound to the identity's project.
    pub client: Client,
    /// Primary instance IPv4, resolved lazily once per connection.
    pub instance_addr: OnceCell<Option<String>>,
    /// Devices created by this connection, for teardown on close.
    pub devices: Mutex<Vec<Arc<ProxyDevice>>>,
    /// Cancelled when the connection goes away.
    pub cancel: CancellationToken,
}

impl SessionCtx {
    pub fn new(
        gw: Arc<Gateway>,
        session_id: String,
        peer: Option<std::net::SocketAddr>,
        identity: Arc<LoginIdentity>,
    ) -> Arc<Self> {
        let mut client = gw.client();
        client.use_project(&identity.project);
        Arc::new(Self {
            gw,
            session_id,
            peer,
            identity,
            client,
            instance_addr: OnceCell::new(),
            devices: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Track a device for teardown when the connection closes.
    pub async fn adopt_device(&self, device: Arc<ProxyDevice>) {
        self.devices.lock().await.push(device);
    }

    /// Shut down every device this connection created.
    pub async fn shutdown_devices(&self) {
        let devices: Vec<Arc<ProxyDevice>> = self.devices.lock().await.drain(..).collect();
        for device in devices {
            if let Err(e) = device.shutdown().await {
                warn!(session = %self.session_id, device = %device.id, error = %e, "device teardown failed");
            }
            self.gw.registry().remove(&device.id);
        }
    }

    /// The instance's primary IPv4, cached on the connection.
    pub async fn instance_address(&self) -> Option<String> {
        self.instance_addr
            .get_or_init(|| async {
                match self.client.get_instance_state(&self.identity.instance).await {
                    Ok(state) => state.primary_ipv4(),
                    Err(e) => {
                        debug!(session = %self.session_id, error = %e, "cannot resolve instance address");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Backend-aware login validation: the instance user must resolve.
    ///
    /// Verdicts are cached both ways (the negative one briefly) to damp
    /// repeated failed-login probing.
    pub async fn validate_login(&self) -> Result<Arc<InstanceUser>, LoginFailure> {
        let identity = &self.identity;
        if let Err(reason) = identity.validate() {
            return Err(LoginFailure::invalid_login(reason));
        }
        let key = format!(
            "{}/{}/{}/{}",
            identity.remote, identity.project, identity.instance, identity.instance_user
        );
        if self.gw.caches.login_invalid.get(&key).await.is_some() {
            return Err(LoginFailure::invalid_login("known-bad login".to_string()));
        }
        match self
            .client
            .instance_user(&identity.instance, &identity.instance_user)
            .await
        {
            Ok(Some(user)) => {
                self.gw.caches.login_valid.insert(key, ()).await;
                Ok(user)
            }
            Ok(None) => {
                self.gw.caches.login_invalid.insert(key, ()).await;
                Err(LoginFailure::invalid_login(format!(
                    "user {} not found in instance {}",
                    identity.instance_user, identity.instance
                )))
            }
            Err(e) => Err(LoginFailure::from_incus(e)),
        }
    }
}

/// A handler-level failure: what to print and which code to exit with.
#[derive(Debug)]
pub struct LoginFailure {
    pub message: String,
    pub exit_code: u32,
}

impl LoginFailure {
    pub fn invalid_login(reason: String) -> Self {
        debug!(%reason, "invalid login");
        Self {
            message: "invalid login".to_string(),
            exit_code: exit::INVALID_LOGIN,
        }
    }

    pub fn from_incus(e: hatchway_core::errors::IncusError) -> Self {
        use hatchway_core::errors::IncusError;
        match e {
            IncusError::ProjectNotFound(project) => Self {
                message: format!("unknown project: {project}"),
                exit_code: exit::INVALID_PROJECT,
            },
            IncusError::InstanceNotFound(instance) => Self {
                message: format!("unknown instance: {instance}"),
                exit_code: exit::INVALID_LOGIN,
            },
            IncusError::Connect(_) | IncusError::Certificate(_) => Self {
                message: "cannot reach the instance manager".to_string(),
                exit_code: exit::BACKEND,
            },
            other => Self {
                message: format!("backend error: {other}"),
                exit_code: exit::BACKEND,
            },
        }
    }
}

/// Write a tagged one-line diagnostic and exit the channel.
///
/// This is the only error surface clients see; details stay in the log.
pub async fn fail_channel(handle: &Handle, id: ChannelId, tag: &str, failure: &LoginFailure) {
    let line = format!("{tag}: {}\r\n", failure.message);
    let _ = handle.data(id, CryptoVec::from_slice(line.as_bytes())).await;
    let _ = handle.exit_status_request(id, failure.exit_code).await;
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}

/// Exit a channel with a code after normal completion.
pub async fn finish_channel(handle: &Handle, id: ChannelId, code: u32) {
    let _ = handle.exit_status_request(id, code).await;
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}

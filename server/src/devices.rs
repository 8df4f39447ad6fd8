//! Transient proxy devices on instances.
//!
//! A proxy device tunnels one stream between the host and an instance
//! namespace. Sessions create them just-in-time (agent sockets, port
//! forwards) and must tear them down on every exit path. All mutations of
//! instance device maps go through one global FIFO queue so two sessions
//! never race on the same instance's ETag.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hatchway_core::errors::IncusError;
use hatchway_core::incus::files;
use hatchway_core::incus::Client;

use crate::registry::DeviceRegistry;

/// Name prefix for every device we create; startup cleanup keys on it.
pub const DEVICE_PREFIX: &str = "hatchway";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Unix socket forwarded host → instance (agent forwarding).
    SocketForward,
    /// TCP port forwarded host → instance-internal address.
    TcpForward,
    /// TCP listener inside the instance, connecting back to the host.
    TcpReverse,
}

impl ProxyKind {
    fn name_part(&self) -> &'static str {
        match self {
            Self::SocketForward => "socket",
            Self::TcpForward => "port",
            Self::TcpReverse => "listen",
        }
    }
}

/// One live proxy device. Shutdown is idempotent.
pub struct ProxyDevice {
    pub id: String,
    pub kind: ProxyKind,
    pub project: String,
    pub instance: String,
    pub source: String,
    pub target: String,
    client: Client,
    queue: Arc<Mutex<()>>,
    /// Host-side socket directory to remove (socket devices only).
    host_socket_dir: Option<PathBuf>,
    shut: AtomicBool,
}

impl ProxyDevice {
    /// Remove the device from the instance and clean up its endpoints.
    ///
    /// Exactly one call does the work; later calls are no-ops so a device
    /// can safely be shut down from both its session and process shutdown.
    pub async fn shutdown(&self) -> Result<(), IncusError> {
        if self.shut.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(
            device = %self.id,
            instance = %self.instance,
            project = %self.project,
            source = %self.source,
            "removing proxy device"
        );
        {
            let _serialized = self.queue.lock().await;
            let (mut instance, etag) = self.client.get_instance_fresh(&self.instance).await?;
            if instance.devices.remove(&self.id).is_some() {
                self.client
                    .update_instance(&instance, etag.as_deref())
                    .await?;
            }
        }
        if self.kind == ProxyKind::SocketForward {
            if let Some(dir) = &self.host_socket_dir {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "cannot remove agent socket dir");
                }
            }
            // The in-instance socket file survives device removal.
            if let Err(e) = files::remove_file(&self.client, &self.instance, &self.target).await {
                warn!(device = %self.id, error = %e, "cannot remove in-instance socket file");
            }
        }
        Ok(())
    }
}

/// Creates proxy devices and serializes all device-map mutations.
pub struct DeviceManager {
    queue: Arc<Mutex<()>>,
    registry: Arc<DeviceRegistry>,
}

impl DeviceManager {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(())),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Forward a host-side Unix socket into the instance.
    ///
    /// Returns the device; its `target` is the in-instance socket path
    /// (used as `SSH_AUTH_SOCK`).
    pub async fn add_socket(
        &self,
        client: &Client,
        instance: &str,
        source: &std::path::Path,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<ProxyDevice>, IncusError> {
        let name = device_name(ProxyKind::SocketForward);
        let target = format!("/tmp/{name}.sock");
        let mut config = BTreeMap::new();
        config.insert("type".to_string(), "proxy".to_string());
        config.insert(
            "connect".to_string(),
            format!("unix:{}", source.display()),
        );
        config.insert("listen".to_string(), format!("unix:{target}"));
        config.insert("bind".to_string(), "instance".to_string());
        config.insert("uid".to_string(), uid.to_string());
        config.insert("gid".to_string(), gid.to_string());
        config.insert("mode".to_string(), "0600".to_string());

        self.insert_device(client, instance, &name, config).await?;

        let device = Arc::new(ProxyDevice {
            id: name,
            kind: ProxyKind::SocketForward,
            project: client.project().to_string(),
            instance: instance.to_string(),
            source: source.display().to_string(),
            target,
            client: client.clone(),
            queue: self.queue.clone(),
            host_socket_dir: source.parent().map(PathBuf::from),
            shut: AtomicBool::new(false),
        });
        self.registry.add(device.clone());
        Ok(device)
    }

    /// Forward a free host port to `dest` as seen from inside the
    /// instance. Returns the device; its `target` is the host-side
    /// address to dial.
    pub async fn add_port(
        &self,
        client: &Client,
        instance: &str,
        dest: &str,
    ) -> Result<Arc<ProxyDevice>, IncusError> {
        let port = free_local_port().await?;
        let name = device_name(ProxyKind::TcpForward);
        let target = format!("127.0.0.1:{port}");
        let mut config = BTreeMap::new();
        config.insert("type".to_string(), "proxy".to_string());
        config.insert("connect".to_string(), format!("tcp:{dest}"));
        config.insert("listen".to_string(), format!("tcp:{target}"));
        config.insert("bind".to_string(), "host".to_string());

        self.insert_device(client, instance, &name, config).await?;

        let device = Arc::new(ProxyDevice {
            id: name,
            kind: ProxyKind::TcpForward,
            project: client.project().to_string(),
            instance: instance.to_string(),
            source: dest.to_string(),
            target,
            client: client.clone(),
            queue: self.queue.clone(),
            host_socket_dir: None,
            shut: AtomicBool::new(false),
        });
        self.registry.add(device.clone());
        Ok(device)
    }

    /// Listen on `bind` inside the instance and tunnel every accepted
    /// connection back to a host-side listener, which is returned for the
    /// reverse-forward handler to accept on.
    pub async fn add_reverse_port(
        &self,
        client: &Client,
        instance: &str,
        bind: &str,
    ) -> Result<(Arc<ProxyDevice>, TcpListener), IncusError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let host_addr = listener.local_addr()?;
        let name = device_name(ProxyKind::TcpReverse);
        let mut config = BTreeMap::new();
        config.insert("type".to_string(), "proxy".to_string());
        config.insert("connect".to_string(), format!("tcp:{host_addr}"));
        config.insert("listen".to_string(), format!("tcp:{bind}"));
        config.insert("bind".to_string(), "instance".to_string());

        self.insert_device(client, instance, &name, config).await?;

        let device = Arc::new(ProxyDevice {
            id: name,
            kind: ProxyKind::TcpReverse,
            project: client.project().to_string(),
            instance: instance.to_string(),
            source: bind.to_string(),
            target: host_addr.to_string(),
            client: client.clone(),
            queue: self.queue.clone(),
            host_socket_dir: None,
            shut: AtomicBool::new(false),
        });
        self.registry.add(device.clone());
        Ok((device, listener))
    }

    /// Read-modify-write of the instance device map under the queue.
    /// A failed operation wait rolls the device entry back.
    async fn insert_device(
        &self,
        client: &Client,
        instance: &str,
        name: &str,
        config: BTreeMap<String, String>,
    ) -> Result<(), IncusError> {
        let _serialized = self.queue.lock().await;
        let (mut snapshot, etag) = client.get_instance_fresh(instance).await?;
        if snapshot.devices.contains_key(name) {
            return Err(IncusError::Operation(format!(
                "device name collision: {name}"
            )));
        }
        snapshot.devices.insert(name.to_string(), config);
        match client.update_instance(&snapshot, etag.as_deref()).await {
            Ok(()) => {
                info!(device = name, instance, "proxy device created");
                Ok(())
            }
            Err(e) => {
                // The update may have half-applied; try to remove our entry.
                if let Ok((mut fresh, etag)) = client.get_instance_fresh(instance).await {
                    if fresh.devices.remove(name).is_some() {
                        let _ = client.update_instance(&fresh, etag.as_deref()).await;
                    }
                }
                Err(e)
            }
        }
    }
}

/// `hatchway-<kind>-<unixtime><rand>`, unique enough per instance and
/// recognizable for the startup sweep.
fn device_name(kind: ProxyKind) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let salt: u16 = rand::thread_rng().gen_range(0..10000);
    format!("{DEVICE_PREFIX}-{}-{secs}{salt:04}", kind.name_part())
}

async fn free_local_port() -> Result<u16, IncusError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_carry_prefix_and_kind() {
        let name = device_name(ProxyKind::SocketForward);
        assert!(name.starts_with("hatchway-socket-"));
        let name = device_name(ProxyKind::TcpForward);
        assert!(name.starts_with("hatchway-port-"));
        let name = device_name(ProxyKind::TcpReverse);
        assert!(name.starts_with("hatchway-listen-"));
    }

    #[test]
    fn device_names_are_unique() {
        let a = device_name(ProxyKind::TcpForward);
        let b = device_name(ProxyKind::TcpForward);
        // Same second, different salt (10^-4 collision chance accepted).
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn free_local_port_is_bindable() {
        let port = free_local_port().await.unwrap();
        assert!(port > 0);
        // The port was released and can be bound again.
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }
}

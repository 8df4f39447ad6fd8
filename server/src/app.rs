//! Process-wide shared state.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use hatchway_core::cache::Caches;
use hatchway_core::config::{CreateConfig, ServerConfig};
use hatchway_core::incus::{Client, Transport};

use crate::devices::DeviceManager;
use crate::guestbin::GuestBinaries;
use crate::registry::DeviceRegistry;

/// Everything a connection handler needs, shared across all connections.
pub struct Gateway {
    pub config: ServerConfig,
    pub create_config: Option<CreateConfig>,
    pub transport: Arc<Transport>,
    pub caches: Caches,
    pub devices: DeviceManager,
    pub guest: GuestBinaries,
    /// Loaded welcome banner template, when configured.
    pub banner: Option<String>,
    pub hostname: String,
    /// Cancelled once, on process shutdown.
    pub shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let transport = hatchway_core::incus::connect_transport(&config.incus)?;
        let caches = Caches::new();
        let registry = Arc::new(DeviceRegistry::new());
        let devices = DeviceManager::new(registry);

        let guest_dir = if config.guest_bin_dir.is_empty() {
            GuestBinaries::default_dir()
        } else {
            PathBuf::from(&config.guest_bin_dir)
        };
        let guest = GuestBinaries::load(&guest_dir)?;

        let create_config = match config.create_config.as_str() {
            "" => None,
            path => Some(CreateConfig::load(std::path::Path::new(path))?),
        };

        let banner = match config.welcome_file.as_str() {
            "" => None,
            path => match std::fs::read_to_string(path) {
                Ok(template) => Some(template),
                Err(e) => {
                    warn!(path, error = %e, "cannot read welcome file");
                    None
                }
            },
        };

        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        Ok(Arc::new(Self {
            config,
            create_config,
            transport,
            caches,
            devices,
            guest,
            banner,
            hostname,
            shutdown: CancellationToken::new(),
        }))
    }

    /// A fresh per-connection client on the shared transport and caches.
    pub fn client(&self) -> Client {
        Client::new(
            self.transport.clone(),
            self.caches.clone(),
            &self.config.incus.image_remote,
        )
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.devices.registry()
    }
}

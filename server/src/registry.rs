//! Process-wide registry of live proxy devices.
//!
//! Sessions clean their own devices up on every exit path; the registry
//! exists so that process shutdown (and nothing else) can sweep whatever
//! is still alive, and so startup can see a consistent picture.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::devices::ProxyDevice;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<ProxyDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: Arc<ProxyDevice>) {
        let mut devices = self.devices.write().expect("registry lock");
        devices.insert(device.id.clone(), device);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ProxyDevice>> {
        let mut devices = self.devices.write().expect("registry lock");
        devices.remove(id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every registered device.
    ///
    /// The id set is snapshotted under the lock, then each device is shut
    /// down outside it. Individual failures are logged and do not stop the
    /// sweep; a cancelled token does.
    pub async fn shutdown_all(&self, cancel: &CancellationToken) {
        let snapshot: Vec<Arc<ProxyDevice>> = {
            let devices = self.devices.read().expect("registry lock");
            devices.values().cloned().collect()
        };
        if snapshot.is_empty() {
            return;
        }
        info!(count = snapshot.len(), "shutting down proxy devices");
        for device in snapshot {
            if cancel.is_cancelled() {
                warn!("device shutdown aborted by cancellation");
                break;
            }
            if let Err(e) = device.shutdown().await {
                warn!(device = %device.id, error = %e, "device shutdown failed");
            }
            self.remove(&device.id);
        }
    }
}

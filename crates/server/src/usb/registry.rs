//! Exported-device registry
//!
//! Tracks which local USB devices are exported and which session holds
//! each one. Devices are keyed by busid; listings iterate the underlying
//! map in key order, so they come out sorted without extra work. A device
//! may be attached to at most one session at a time: `acquire` hands out a
//! [`DeviceClaim`] carrying a generation counter, and only the matching
//! claim can release the attachment.

use protocol::ExportedDevice;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Registry-level failures, surfaced to clients as negative wire replies
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("busid {0} is already registered")]
    DuplicateBusId(String),

    #[error("busid {0} is not registered")]
    NotFound(String),

    #[error("busid {0} is attached to another session")]
    AlreadyAttached(String),
}

struct RegistryInner {
    /// Exported devices by busid; BTreeMap keeps listings deterministic
    devices: BTreeMap<String, ExportedDevice>,
    /// Attachment generation per busid, present while a claim is live
    attached: HashMap<String, u64>,
    next_generation: u64,
}

/// Shared registry of exported devices
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            inner: Mutex::new(RegistryInner {
                devices: BTreeMap::new(),
                attached: HashMap::new(),
                next_generation: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a device snapshot to the registry
    pub fn register(&self, device: ExportedDevice) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.devices.contains_key(&device.busid) {
            return Err(RegistryError::DuplicateBusId(device.busid));
        }
        debug!(
            "registered {} ({:04x}:{:04x})",
            device.busid, device.vendor_id, device.product_id
        );
        inner.devices.insert(device.busid.clone(), device);
        Ok(())
    }

    /// Snapshot of all exported devices, sorted by busid
    pub fn list(&self) -> Vec<ExportedDevice> {
        self.lock().devices.values().cloned().collect()
    }

    /// Look up a single device
    pub fn get(&self, busid: &str) -> Option<ExportedDevice> {
        self.lock().devices.get(busid).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    /// Take exclusive ownership of a device for one session
    ///
    /// The returned claim releases the attachment when dropped, so a
    /// session torn down on any path gives the device back.
    pub fn acquire(self: &Arc<Self>, busid: &str) -> Result<DeviceClaim, RegistryError> {
        let mut inner = self.lock();
        let device = inner
            .devices
            .get(busid)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(busid.to_string()))?;
        if inner.attached.contains_key(busid) {
            return Err(RegistryError::AlreadyAttached(busid.to_string()));
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.attached.insert(busid.to_string(), generation);
        info!("device {} attached (generation {})", busid, generation);
        Ok(DeviceClaim {
            registry: Arc::clone(self),
            device,
            generation,
        })
    }

    /// Drop a vanished device. An outstanding claim on it stays valid for
    /// release bookkeeping only.
    pub fn remove(&self, busid: &str) -> bool {
        let mut inner = self.lock();
        inner.attached.remove(busid);
        inner.devices.remove(busid).is_some()
    }

    /// Idempotent release; a stale generation is a no-op
    fn release(&self, busid: &str, generation: u64) {
        let mut inner = self.lock();
        if inner.attached.get(busid) == Some(&generation) {
            inner.attached.remove(busid);
            info!("device {} released (generation {})", busid, generation);
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive claim on an exported device
///
/// Holds the device snapshot taken at acquire time. Dropping the claim
/// releases the attachment.
pub struct DeviceClaim {
    registry: Arc<DeviceRegistry>,
    device: ExportedDevice,
    generation: u64,
}

impl DeviceClaim {
    pub fn device(&self) -> &ExportedDevice {
        &self.device
    }

    pub fn busid(&self) -> &str {
        &self.device.busid
    }

    /// Explicit release; equivalent to dropping the claim
    pub fn release(self) {}
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.registry.release(&self.device.busid, self.generation);
    }
}

impl std::fmt::Debug for DeviceClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClaim")
            .field("busid", &self.device.busid)
            .field("generation", &self.generation)
            .finish()
    }
}

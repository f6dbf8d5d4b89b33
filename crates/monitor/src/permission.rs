//! Permission registry
//!
//! Positive cache of granted devices. A key present means "permission was
//! observed as granted"; absence means unknown or denied. Single queries are
//! write-through: the host is asked fresh and the answer replaces the cached
//! entry. The cached set is only read directly by the poll loop, which needs
//! a before/after count.

use crate::host::UsbHost;
use crate::lock;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::trace;
use usb_types::{DeviceDescriptor, DeviceKey, KeyMode};

pub struct PermissionRegistry {
    mode: KeyMode,
    granted: Mutex<HashSet<DeviceKey>>,
}

impl PermissionRegistry {
    pub fn new(mode: KeyMode) -> Self {
        Self {
            mode,
            granted: Mutex::new(HashSet::new()),
        }
    }

    /// Ask the host and record the answer
    pub fn check(&self, host: &dyn UsbHost, device: &DeviceDescriptor) -> bool {
        let granted = host.has_permission(device);
        self.record(device, granted);
        granted
    }

    /// Record a known answer
    pub fn record(&self, device: &DeviceDescriptor, granted: bool) {
        let key = DeviceKey::compute(device, self.mode);
        trace!("Permission for {} recorded as {}", key, granted);
        let mut set = lock(&self.granted);
        if granted {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    /// Forget a device
    pub fn revoke(&self, device: &DeviceDescriptor) {
        lock(&self.granted).remove(&DeviceKey::compute(device, self.mode));
    }

    /// Cached answer without asking the host
    pub fn is_cached(&self, device: &DeviceDescriptor) -> bool {
        lock(&self.granted).contains(&DeviceKey::compute(device, self.mode))
    }

    /// Rebuild the cache from a fresh batch query
    ///
    /// Returns the number of granted entries before and after.
    pub fn refresh(&self, host: &dyn UsbHost, devices: &[DeviceDescriptor]) -> (usize, usize) {
        // Ask the host outside the lock
        let fresh: HashSet<DeviceKey> = devices
            .iter()
            .filter(|d| host.has_permission(d))
            .map(|d| DeviceKey::compute(d, self.mode))
            .collect();

        let mut set = lock(&self.granted);
        let before = set.len();
        *set = fresh;
        (before, set.len())
    }

    pub fn len(&self) -> usize {
        lock(&self.granted).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.granted).clear();
    }
}

//! Control blocks
//!
//! A [`ControlBlock`] owns the open OS handle of one device and the
//! interfaces claimed through it. It is shared: the monitor keeps one clone
//! in its table and hands others to consumers. Whoever calls
//! [`ControlBlock::close`] first releases everything; later calls are no-ops.
//!
//! Closing a tracked block tells the monitor, which drops it from the table
//! and dispatches `on_disconnect` before `close` returns.

use crate::host::{DeviceConnection, UsbHost};
use crate::lock;
use common::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, trace, warn};
use usb_types::{DeviceDescriptor, DeviceId, DeviceKey, InterfaceDescriptor};

/// Claimed interface, identified by number and alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceHandle {
    pub number: u8,
    pub alt_setting: u8,
}

/// Notified once when a tracked block closes
pub(crate) trait CloseNotifier: Send + Sync {
    fn block_closed(&self, block: &ControlBlock);
}

/// Shared handle to an open device
#[derive(Clone)]
pub struct ControlBlock {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    descriptor: DeviceDescriptor,
    key: DeviceKey,
    host: Arc<dyn UsbHost>,
    /// `None` for duplicates, which the monitor does not track
    monitor: Option<Weak<dyn CloseNotifier>>,
    /// Set by whichever path dispatches `on_disconnect` for this block
    disconnected: AtomicBool,
    state: Mutex<BlockState>,
}

struct BlockState {
    /// `None` once closed
    connection: Option<Box<dyn DeviceConnection>>,
    interfaces: HashMap<InterfaceHandle, InterfaceDescriptor>,
}

impl ControlBlock {
    /// Open `descriptor` on the host
    pub(crate) fn open(
        host: Arc<dyn UsbHost>,
        descriptor: DeviceDescriptor,
        key: DeviceKey,
        monitor: Option<Weak<dyn CloseNotifier>>,
    ) -> Result<Self> {
        let connection = host.open(&descriptor)?;
        info!("Opened {}", descriptor);

        Ok(Self {
            inner: Arc::new(BlockInner {
                descriptor,
                key,
                host,
                monitor,
                disconnected: AtomicBool::new(false),
                state: Mutex::new(BlockState {
                    connection: Some(connection),
                    interfaces: HashMap::new(),
                }),
            }),
        })
    }

    /// Descriptor the block was opened for
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    /// Key the monitor tracks the block under
    pub fn key(&self) -> &DeviceKey {
        &self.inner.key
    }

    /// Bus location
    pub fn device_id(&self) -> DeviceId {
        self.inner.descriptor.id()
    }

    pub fn vendor_id(&self) -> u16 {
        self.inner.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.inner.descriptor.product_id
    }

    pub fn bus_number(&self) -> u8 {
        self.inner.descriptor.bus_number
    }

    pub fn device_address(&self) -> u8 {
        self.inner.descriptor.device_address
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.inner.descriptor.serial_number.as_deref()
    }

    /// Manufacturer string, or the vendor id in hex
    pub fn manufacturer(&self) -> String {
        self.inner.descriptor.display_manufacturer()
    }

    /// Product string, or the product id in hex
    pub fn product(&self) -> String {
        self.inner.descriptor.display_product()
    }

    pub fn usb_version(&self) -> Option<String> {
        self.inner.descriptor.usb_version_string()
    }

    pub fn device_version(&self) -> Option<String> {
        self.inner.descriptor.device_version_string()
    }

    /// Whether the monitor tracks this block
    pub fn is_tracked(&self) -> bool {
        self.inner.monitor.is_some()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).connection.is_none()
    }

    /// Whether `device` is the device this block was opened for
    pub fn is_for(&self, device: &DeviceDescriptor) -> bool {
        let own = &self.inner.descriptor;
        own.id() == device.id() && own.vendor_id == device.vendor_id && own.product_id == device.product_id
    }

    /// Same shared block, not merely the same device
    pub(crate) fn same_instance(&self, other: &ControlBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Claim the right to dispatch `on_disconnect`
    ///
    /// True for exactly one caller over the block's lifetime. A consumer
    /// close and a monitor-forced close may race; only the winner reports.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.inner.disconnected.swap(true, Ordering::AcqRel)
    }

    /// Claim an interface
    ///
    /// Claiming an already claimed interface returns the existing handle.
    /// `force` detaches a kernel driver bound to the interface first.
    pub fn claim_interface(&self, number: u8, alt_setting: u8, force: bool) -> Result<InterfaceHandle> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let connection = state.connection.as_mut().ok_or(Error::AlreadyClosed)?;

        let handle = InterfaceHandle { number, alt_setting };
        if state.interfaces.contains_key(&handle) {
            trace!("Interface {} (alt {}) already claimed", number, alt_setting);
            return Ok(handle);
        }

        let interface = self
            .inner
            .descriptor
            .interface(number, alt_setting)
            .cloned()
            .ok_or(Error::InterfaceNotFound {
                interface: number,
                alt_setting,
            })?;

        connection.claim_interface(&interface, force)?;
        state.interfaces.insert(handle, interface);
        debug!(
            "Claimed interface {} (alt {}) on {}",
            number,
            alt_setting,
            self.inner.descriptor.id()
        );
        Ok(handle)
    }

    /// Release a claimed interface
    ///
    /// No-op for interfaces that are not claimed, including every interface
    /// of a closed block.
    pub fn release_interface(&self, handle: InterfaceHandle) -> Result<()> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;

        let Some(interface) = state.interfaces.remove(&handle) else {
            return Ok(());
        };
        if let Some(connection) = state.connection.as_mut() {
            connection.release_interface(&interface)?;
        }
        debug!(
            "Released interface {} (alt {}) on {}",
            handle.number,
            handle.alt_setting,
            self.inner.descriptor.id()
        );
        Ok(())
    }

    /// Look up an interface of the device without claiming it
    pub fn interface(&self, number: u8, alt_setting: u8) -> Result<Option<InterfaceDescriptor>> {
        if self.is_closed() {
            return Err(Error::AlreadyClosed);
        }
        Ok(self.inner.descriptor.interface(number, alt_setting).cloned())
    }

    /// Currently claimed interfaces, sorted
    pub fn claimed_interfaces(&self) -> Vec<InterfaceHandle> {
        let mut handles: Vec<_> = lock(&self.inner.state).interfaces.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Close the block
    ///
    /// Releases every claimed interface and closes the OS handle. Errors from
    /// the host are logged, never returned: a device that vanished mid-close
    /// is still closed as far as the consumer is concerned.
    pub fn close(&self) {
        let taken = {
            let mut state = lock(&self.inner.state);
            state
                .connection
                .take()
                .map(|connection| (connection, std::mem::take(&mut state.interfaces)))
        };
        let Some((mut connection, interfaces)) = taken else {
            trace!("{} already closed", self.inner.descriptor.id());
            return;
        };

        for (handle, interface) in interfaces {
            if let Err(e) = connection.release_interface(&interface) {
                warn!(
                    "Failed to release interface {} on {}: {}",
                    handle.number,
                    self.inner.descriptor.id(),
                    e
                );
            }
        }
        if let Err(e) = connection.close() {
            warn!("Failed to close {}: {}", self.inner.descriptor.id(), e);
        }
        info!("Closed {}", self.inner.descriptor);

        if let Some(monitor) = self.inner.monitor.as_ref().and_then(Weak::upgrade) {
            monitor.block_closed(self);
        }
    }

    /// Open a second, independent handle to the same device
    ///
    /// The duplicate is not tracked by the monitor: it receives no events
    /// and must be closed by the caller.
    pub fn duplicate(&self) -> Result<ControlBlock> {
        if self.is_closed() {
            return Err(Error::AlreadyClosed);
        }
        if !self.inner.host.has_permission(&self.inner.descriptor) {
            return Err(Error::AccessDenied);
        }
        ControlBlock::open(
            self.inner.host.clone(),
            self.inner.descriptor.clone(),
            self.inner.key.clone(),
            None,
        )
    }
}

/// Equal when both blocks refer to the same physical device
impl PartialEq for ControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.inner.descriptor.id() == other.inner.descriptor.id() && self.inner.key == other.inner.key
    }
}

impl Eq for ControlBlock {}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("device", &self.inner.descriptor.id())
            .field("key", &self.inner.key)
            .field("tracked", &self.is_tracked())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for BlockInner {
    // Last reference gone without close(): give the OS handle back quietly
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = state.connection.take() {
            debug!("Closing unreleased handle of {}", self.descriptor.id());
            if let Err(e) = connection.close() {
                debug!("Failed to close {}: {}", self.descriptor.id(), e);
            }
        }
    }
}

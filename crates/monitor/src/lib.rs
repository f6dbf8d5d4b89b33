//! USB device monitor and permission broker
//!
//! Tracks attach and detach of USB devices, brokers access permission with
//! the host, and hands out [`ControlBlock`]s: exclusive open handles whose
//! lifetime the monitor manages together with the consumer.
//!
//! # Architecture
//!
//! - [`host`]: the OS boundary ([`UsbHost`]) and its libusb implementation
//! - [`worker`]: the task queue every transition and callback runs on
//! - [`monitor`]: the [`DeviceMonitor`] state machine and its poll loop
//! - [`control_block`]: per-device open handle and claimed interfaces
//! - [`permission`]: cached permission grants
//! - [`listener`]: consumer callbacks and the channel adapter
//! - [`testing`]: scriptable in-memory host
//!
//! # Example
//!
//! ```
//! use monitor::testing::FakeHost;
//! use monitor::{event_channel, DeviceEvent, DeviceMonitor, MonitorSettings, Worker};
//! use std::sync::Arc;
//! use usb_types::DeviceDescriptor;
//!
//! let host = FakeHost::new();
//! host.add_device(DeviceDescriptor::new(0x1234, 0x5678));
//!
//! let worker = Worker::spawn("doc-monitor").unwrap();
//! let monitor = DeviceMonitor::new(Arc::new(host.clone()), worker.handle(), MonitorSettings::default());
//! let (listener, events) = event_channel();
//! monitor.register(listener).unwrap();
//!
//! monitor.poll_now().unwrap();
//! monitor.flush().unwrap();
//! assert!(matches!(events.try_recv(), Ok(DeviceEvent::Attach(_))));
//!
//! monitor.destroy();
//! worker.shutdown();
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod config;
pub mod control_block;
pub mod host;
pub mod listener;
pub mod monitor;
pub mod permission;
pub mod testing;
pub mod worker;

pub use control_block::{ControlBlock, InterfaceHandle};
pub use host::{DeviceConnection, HostEvent, HostEventSink, HotplugSubscription, RusbHost, UsbHost};
pub use listener::{event_channel, ChannelListener, DeviceEvent, DeviceListener};
pub use monitor::{DeviceMonitor, DeviceState, MonitorSettings};
pub use permission::PermissionRegistry;
pub use worker::{Worker, WorkerHandle};

// A panicking listener runs under catch_unwind on the worker; the tables it
// may have poisoned are still structurally valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

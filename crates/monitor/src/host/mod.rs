//! OS boundary
//!
//! Everything the monitor needs from the host USB subsystem goes through
//! [`UsbHost`]. The production implementation is [`RusbHost`]; tests drive
//! the monitor through [`crate::testing::FakeHost`].

use common::HostError;
use std::fmt;
use std::sync::Arc;
use usb_types::{DeviceDescriptor, InterfaceDescriptor};

pub mod rusb_host;

pub use rusb_host::RusbHost;

/// Out-of-band notification from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A device appeared
    Attached(DeviceDescriptor),
    /// A device was physically removed
    Detached(DeviceDescriptor),
    /// Outcome of a permission request
    PermissionResult {
        device: DeviceDescriptor,
        granted: bool,
    },
}

/// Destination for [`HostEvent`]s
///
/// Hosts may deliver from any thread, including from inside the call that
/// triggered the event. The receiving side only queues the event.
#[derive(Clone)]
pub struct HostEventSink {
    deliver: Arc<dyn Fn(HostEvent) + Send + Sync>,
}

impl HostEventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(HostEvent) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Deliver one event
    pub fn deliver(&self, event: HostEvent) {
        (self.deliver)(event);
    }
}

impl fmt::Debug for HostEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEventSink").finish_non_exhaustive()
    }
}

/// Host USB subsystem
pub trait UsbHost: Send + Sync + 'static {
    /// Snapshot of every attached device
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, HostError>;

    /// Fresh answer from the OS permission authority
    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Ask for access to a device
    ///
    /// `Ok` means a request is in flight and its outcome will arrive through
    /// `results` as [`HostEvent::PermissionResult`]. `Err` means the request
    /// could not even be issued.
    fn request_permission(&self, device: &DeviceDescriptor, results: &HostEventSink) -> Result<(), HostError>;

    /// Open a communication handle
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn DeviceConnection>, HostError>;

    /// Start delivering attach and detach notifications
    ///
    /// Returns `Ok(None)` when the platform has no hot-plug support. The
    /// monitor then relies on polling alone.
    fn watch_hotplug(&self, sink: HostEventSink) -> Result<Option<Box<dyn HotplugSubscription>>, HostError>;
}

/// Open OS handle to one device
pub trait DeviceConnection: Send {
    /// Claim an interface, detaching a kernel driver first when `force` is set
    fn claim_interface(&mut self, interface: &InterfaceDescriptor, force: bool) -> Result<(), HostError>;

    /// Release a previously claimed interface
    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<(), HostError>;

    /// Close the handle
    fn close(self: Box<Self>) -> Result<(), HostError>;
}

/// Active hot-plug registration
pub trait HotplugSubscription: Send {
    /// Stop delivering notifications
    fn unsubscribe(self: Box<Self>);
}

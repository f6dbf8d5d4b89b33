//! Consumer callbacks
//!
//! Every callback runs on the monitor's worker thread, one at a time, in the
//! order the underlying transitions happened. Callbacks must not block for
//! long; they delay every other event.

use crate::control_block::ControlBlock;
use async_channel::{Receiver, Sender};
use tracing::trace;
use usb_types::DeviceDescriptor;

/// Receiver of monitor events
///
/// All methods default to doing nothing.
pub trait DeviceListener: Send + Sync + 'static {
    /// A matching device is present
    ///
    /// Also re-announced by the poll loop whenever the set of matching
    /// devices grows or new permissions appear.
    fn on_attach(&self, _device: &DeviceDescriptor) {}

    /// Permission granted and an open handle is available
    ///
    /// `created_new` is false when the handle already existed.
    fn on_connect(&self, _device: &DeviceDescriptor, _block: &ControlBlock, _created_new: bool) {}

    /// A handle was closed
    fn on_disconnect(&self, _device: &DeviceDescriptor, _block: &ControlBlock) {}

    /// Permission denied or the request failed
    fn on_cancel(&self, _device: &DeviceDescriptor) {}

    /// The device was physically removed
    fn on_detach(&self, _device: &DeviceDescriptor) {}
}

/// One listener callback as a value
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attach(DeviceDescriptor),
    Connect {
        device: DeviceDescriptor,
        block: ControlBlock,
        created_new: bool,
    },
    Disconnect {
        device: DeviceDescriptor,
        block: ControlBlock,
    },
    Cancel(DeviceDescriptor),
    Detach(DeviceDescriptor),
}

impl DeviceEvent {
    /// Device the event is about
    pub fn device(&self) -> &DeviceDescriptor {
        match self {
            Self::Attach(device) | Self::Cancel(device) | Self::Detach(device) => device,
            Self::Connect { device, .. } | Self::Disconnect { device, .. } => device,
        }
    }

    /// Short lowercase name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Attach(_) => "attach",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Cancel(_) => "cancel",
            Self::Detach(_) => "detach",
        }
    }

    /// Invoke the matching callback on `listener`
    pub fn deliver_to(&self, listener: &dyn DeviceListener) {
        match self {
            Self::Attach(device) => listener.on_attach(device),
            Self::Connect {
                device,
                block,
                created_new,
            } => listener.on_connect(device, block, *created_new),
            Self::Disconnect { device, block } => listener.on_disconnect(device, block),
            Self::Cancel(device) => listener.on_cancel(device),
            Self::Detach(device) => listener.on_detach(device),
        }
    }
}

/// Listener that forwards every callback into a channel
///
/// Lets async consumers `recv().await` events instead of implementing
/// [`DeviceListener`].
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: Sender<DeviceEvent>,
}

impl ChannelListener {
    fn forward(&self, event: DeviceEvent) {
        if self.tx.try_send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

/// Create a [`ChannelListener`] and its receiving end
pub fn event_channel() -> (ChannelListener, Receiver<DeviceEvent>) {
    let (tx, rx) = async_channel::unbounded();
    (ChannelListener { tx }, rx)
}

impl DeviceListener for ChannelListener {
    fn on_attach(&self, device: &DeviceDescriptor) {
        self.forward(DeviceEvent::Attach(device.clone()));
    }

    fn on_connect(&self, device: &DeviceDescriptor, block: &ControlBlock, created_new: bool) {
        self.forward(DeviceEvent::Connect {
            device: device.clone(),
            block: block.clone(),
            created_new,
        });
    }

    fn on_disconnect(&self, device: &DeviceDescriptor, block: &ControlBlock) {
        self.forward(DeviceEvent::Disconnect {
            device: device.clone(),
            block: block.clone(),
        });
    }

    fn on_cancel(&self, device: &DeviceDescriptor) {
        self.forward(DeviceEvent::Cancel(device.clone()));
    }

    fn on_detach(&self, device: &DeviceDescriptor) {
        self.forward(DeviceEvent::Detach(device.clone()));
    }
}

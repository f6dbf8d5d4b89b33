//! libusb backed host
//!
//! Permission on a desktop OS is "can the device node be opened". There is no
//! interactive prompt, so a permission request is answered immediately with
//! the result of a fresh open attempt.
//!
//! libusb forbids most synchronous I/O inside hot-plug callbacks. The
//! callback only queues the raw device; descriptors (including string
//! descriptors, which need an open handle) are read on the event thread after
//! `handle_events` returns.

use super::{DeviceConnection, HostEvent, HostEventSink, HotplugSubscription, UsbHost};
use crate::lock;
use common::HostError;
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use usb_types::{DeviceDescriptor, DeviceId, InterfaceDescriptor};

/// How long one `handle_events` call may block
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

type DescriptorCache = Arc<Mutex<HashMap<DeviceId, DeviceDescriptor>>>;

/// [`UsbHost`] on top of libusb
pub struct RusbHost {
    context: Context,
    /// Last descriptor read per location, so a detach reports the same
    /// identity (strings included) that the attach did
    cache: DescriptorCache,
}

impl RusbHost {
    pub fn new() -> Result<Self, HostError> {
        let context = Context::new().map_err(map_rusb_error)?;
        info!("libusb context created (hot-plug support: {})", rusb::has_hotplug());
        Ok(Self {
            context,
            cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn find_device(&self, descriptor: &DeviceDescriptor) -> Result<Device<Context>, HostError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| {
                d.bus_number() == descriptor.bus_number
                    && d.address() == descriptor.device_address
                    && d.device_descriptor().is_ok_and(|desc| {
                        desc.vendor_id() == descriptor.vendor_id
                            && desc.product_id() == descriptor.product_id
                    })
            })
            .ok_or(HostError::NoDevice)
    }
}

impl UsbHost for RusbHost {
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, HostError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut result = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            if is_root_hub(&device) {
                trace!(
                    "Skipping root hub: bus={}, addr={}",
                    device.bus_number(),
                    device.address()
                );
                continue;
            }
            match read_descriptor(&device) {
                Ok(descriptor) => result.push(descriptor),
                Err(e) => warn!(
                    "Failed to read descriptor of device at {:03}/{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        let mut cache = lock(&self.cache);
        cache.clear();
        cache.extend(result.iter().map(|d| (d.id(), d.clone())));

        debug!("Enumerated {} devices", result.len());
        Ok(result)
    }

    fn has_permission(&self, descriptor: &DeviceDescriptor) -> bool {
        let Ok(device) = self.find_device(descriptor) else {
            return false;
        };
        match device.open() {
            Ok(_) => true,
            Err(e) => {
                trace!("Cannot open {}: {}", descriptor, e);
                false
            }
        }
    }

    fn request_permission(&self, descriptor: &DeviceDescriptor, results: &HostEventSink) -> Result<(), HostError> {
        self.find_device(descriptor)?;
        let granted = self.has_permission(descriptor);
        debug!("Permission for {}: {}", descriptor, if granted { "granted" } else { "denied" });
        results.deliver(HostEvent::PermissionResult {
            device: descriptor.clone(),
            granted,
        });
        Ok(())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceConnection>, HostError> {
        let device = self.find_device(descriptor)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", descriptor, e);
            map_rusb_error(e)
        })?;
        debug!("Opened device {}", descriptor.id());

        Ok(Box::new(RusbConnection {
            handle,
            id: descriptor.id(),
            detached_drivers: Vec::new(),
        }))
    }

    fn watch_hotplug(&self, sink: HostEventSink) -> Result<Option<Box<dyn HotplugSubscription>>, HostError> {
        if !rusb::has_hotplug() {
            info!("libusb has no hot-plug support on this platform");
            return Ok(None);
        }

        let (tx, rx) = async_channel::unbounded();
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugCallback { tx }))
            .map_err(map_rusb_error)?;

        let stop = Arc::new(AtomicBool::new(false));
        let context = self.context.clone();
        let cache = self.cache.clone();
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run_event_loop(context, rx, cache, sink, thread_stop))
            .map_err(|e| HostError::Other(e.to_string()))?;

        debug!("Hot-plug callbacks registered");
        Ok(Some(Box::new(RusbSubscription {
            registration: Some(registration),
            stop,
            thread: Some(thread),
        })))
    }
}

/// Raw notification queued by the libusb callback
enum Notification {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

struct HotplugCallback {
    tx: async_channel::Sender<Notification>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        trace!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.try_send(Notification::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        trace!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.try_send(Notification::Left(device));
    }
}

fn run_event_loop(
    context: Context,
    rx: async_channel::Receiver<Notification>,
    cache: DescriptorCache,
    sink: HostEventSink,
    stop: Arc<AtomicBool>,
) {
    debug!("Hot-plug event thread started");

    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }

        while let Ok(notification) = rx.try_recv() {
            match notification {
                Notification::Arrived(device) => {
                    if is_root_hub(&device) {
                        continue;
                    }
                    match read_descriptor(&device) {
                        Ok(descriptor) => {
                            lock(&cache).insert(descriptor.id(), descriptor.clone());
                            sink.deliver(HostEvent::Attached(descriptor));
                        }
                        Err(e) => warn!("Failed to read descriptor of arrived device: {}", e),
                    }
                }
                Notification::Left(device) => {
                    let id = DeviceId {
                        bus: device.bus_number(),
                        address: device.address(),
                    };
                    let cached = lock(&cache).remove(&id);
                    let descriptor = match cached {
                        Some(descriptor) => descriptor,
                        // libusb keeps the device descriptor of a removed device
                        None => match read_basic_descriptor(&device) {
                            Ok(descriptor) => descriptor,
                            Err(e) => {
                                debug!("Ignoring removal of unknown device {}: {}", id, e);
                                continue;
                            }
                        },
                    };
                    sink.deliver(HostEvent::Detached(descriptor));
                }
            }
        }
    }

    debug!("Hot-plug event thread stopped");
}

struct RusbSubscription {
    registration: Option<Registration<Context>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RusbSubscription {
    fn stop(&mut self) {
        // Deregister first so no callback fires into a stopping thread
        drop(self.registration.take());
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Hot-plug event thread panicked");
        }
    }
}

impl HotplugSubscription for RusbSubscription {
    fn unsubscribe(mut self: Box<Self>) {
        self.stop();
        debug!("Hot-plug callbacks deregistered");
    }
}

impl Drop for RusbSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open libusb handle
struct RusbConnection {
    handle: DeviceHandle<Context>,
    id: DeviceId,
    /// Interfaces whose kernel driver we detached and must give back
    detached_drivers: Vec<u8>,
}

impl DeviceConnection for RusbConnection {
    fn claim_interface(&mut self, interface: &InterfaceDescriptor, force: bool) -> Result<(), HostError> {
        let number = interface.number;

        if force {
            match self.handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {} on {}", number, self.id);
                    match self.handle.detach_kernel_driver(number) {
                        Ok(()) => self.detached_drivers.push(number),
                        Err(e) => warn!("Failed to detach kernel driver from interface {}: {}", number, e),
                    }
                }
                Ok(false) => debug!("No kernel driver active on interface {}", number),
                Err(e) => debug!("Could not check kernel driver status for interface {}: {}", number, e),
            }
        }

        self.handle.claim_interface(number).map_err(map_rusb_error)?;
        if interface.alt_setting != 0 {
            self.handle
                .set_alternate_setting(number, interface.alt_setting)
                .map_err(map_rusb_error)?;
        }

        debug!(
            "Claimed interface {} (alt {}) on {}",
            number, interface.alt_setting, self.id
        );
        Ok(())
    }

    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<(), HostError> {
        let number = interface.number;
        self.handle.release_interface(number).map_err(map_rusb_error)?;

        if let Some(pos) = self.detached_drivers.iter().position(|n| *n == number) {
            self.detached_drivers.swap_remove(pos);
            match self.handle.attach_kernel_driver(number) {
                Ok(()) => debug!("Reattached kernel driver to interface {} on {}", number, self.id),
                Err(e) => debug!("Could not reattach kernel driver to interface {}: {}", number, e),
            }
        }

        debug!("Released interface {} on {}", number, self.id);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), HostError> {
        // libusb_close runs when the handle drops
        debug!("Closed device {}", self.id);
        Ok(())
    }
}

fn is_root_hub(device: &Device<Context>) -> bool {
    device
        .device_descriptor()
        .is_ok_and(|desc| desc.vendor_id() == 0x1d6b && desc.class_code() == 9)
}

/// Descriptor without string fields or interfaces
fn read_basic_descriptor(device: &Device<Context>) -> Result<DeviceDescriptor, rusb::Error> {
    let desc = device.device_descriptor()?;

    let mut descriptor = DeviceDescriptor::new(desc.vendor_id(), desc.product_id())
        .with_class(desc.class_code(), desc.sub_class_code(), desc.protocol_code())
        .at(device.bus_number(), device.address());
    descriptor.num_configurations = desc.num_configurations();
    descriptor.usb_version = Some(version_to_bcd(desc.usb_version()));
    descriptor.device_version = Some(version_to_bcd(desc.device_version()));
    Ok(descriptor)
}

/// Full descriptor
///
/// Strings are only readable when the device can be opened; they stay `None`
/// otherwise.
fn read_descriptor(device: &Device<Context>) -> Result<DeviceDescriptor, rusb::Error> {
    let mut descriptor = read_basic_descriptor(device)?;
    let desc = device.device_descriptor()?;

    if let Ok(handle) = device.open() {
        descriptor.manufacturer = desc
            .manufacturer_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        descriptor.product = desc
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        descriptor.serial_number = desc
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    }

    match device.active_config_descriptor() {
        Ok(config) => {
            for interface in config.interfaces() {
                for setting in interface.descriptors() {
                    descriptor.interfaces.push(
                        InterfaceDescriptor::new(
                            setting.interface_number(),
                            setting.class_code(),
                            setting.sub_class_code(),
                            setting.protocol_code(),
                        )
                        .with_alt_setting(setting.setting_number()),
                    );
                }
            }
        }
        Err(e) => debug!("No active configuration for {}: {}", descriptor.id(), e),
    }

    Ok(descriptor)
}

/// Re-encode a decoded libusb version as BCD
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

fn map_rusb_error(err: rusb::Error) -> HostError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => HostError::NoDevice,
        rusb::Error::Access => HostError::Access,
        rusb::Error::Busy => HostError::Busy,
        rusb::Error::NotSupported => HostError::NotSupported,
        other => HostError::Other(other.to_string()),
    }
}

//! USB device descriptor snapshots
//!
//! A [`DeviceDescriptor`] is the immutable identity and metadata snapshot the
//! OS reports for one attached device. The monitor never mutates it; a new
//! snapshot is produced on every enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical location of a device on the host
///
/// Bus number plus device address. Stable while the device stays plugged in,
/// reassigned by the OS on re-insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}", self.bus, self.address)
    }
}

/// One interface (alternate setting) of the active configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber
    pub number: u8,
    /// bAlternateSetting
    pub alt_setting: u8,
    /// Interface class
    pub class: u8,
    /// Interface subclass
    pub subclass: u8,
    /// Interface protocol
    pub protocol: u8,
}

impl InterfaceDescriptor {
    /// Create an interface descriptor with alternate setting 0
    pub fn new(number: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            number,
            alt_setting: 0,
            class,
            subclass,
            protocol,
        }
    }

    /// Same interface with a different alternate setting
    pub fn with_alt_setting(mut self, alt_setting: u8) -> Self {
        self.alt_setting = alt_setting;
        self
    }
}

/// Device descriptor snapshot
///
/// Contains everything the monitor needs to identify, filter and key a
/// device. String fields are `None` when the OS could not read them (most
/// often because the application has no permission to open the device yet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Bus number on the host
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// Manufacturer string (if available)
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Product string (if available)
    #[serde(default)]
    pub product: Option<String>,
    /// Serial number string (if available)
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Number of configurations
    #[serde(default = "DeviceDescriptor::default_num_configurations")]
    pub num_configurations: u8,
    /// bcdUSB (if the OS exposes it)
    #[serde(default)]
    pub usb_version: Option<u16>,
    /// bcdDevice (if the OS exposes it)
    #[serde(default)]
    pub device_version: Option<u16>,
    /// Interfaces of the active configuration
    #[serde(default)]
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceDescriptor {
    /// Create a bare descriptor with the given ids
    ///
    /// Class triple is zero ("defined at interface level"), location is
    /// bus 1 / address 1 and no strings or interfaces are set.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            class: 0,
            subclass: 0,
            protocol: 0,
            bus_number: 1,
            device_address: 1,
            manufacturer: None,
            product: None,
            serial_number: None,
            num_configurations: 1,
            usb_version: None,
            device_version: None,
            interfaces: Vec::new(),
        }
    }

    fn default_num_configurations() -> u8 {
        1
    }

    /// Set the device-level class triple
    pub fn with_class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.class = class;
        self.subclass = subclass;
        self.protocol = protocol;
        self
    }

    /// Set the bus location
    pub fn at(mut self, bus_number: u8, device_address: u8) -> Self {
        self.bus_number = bus_number;
        self.device_address = device_address;
        self
    }

    /// Set the serial number string
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set manufacturer and product strings
    pub fn with_strings(mut self, manufacturer: impl Into<String>, product: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self.product = Some(product.into());
        self
    }

    /// Append an interface
    pub fn with_interface(mut self, interface: InterfaceDescriptor) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Physical location of this device
    pub fn id(&self) -> DeviceId {
        DeviceId {
            bus: self.bus_number,
            address: self.device_address,
        }
    }

    /// Find the interface with the given number and alternate setting
    pub fn interface(&self, number: u8, alt_setting: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.number == number && i.alt_setting == alt_setting)
    }

    /// bcdUSB rendered as `major.minor` (e.g. "2.00")
    pub fn usb_version_string(&self) -> Option<String> {
        self.usb_version.map(format_bcd)
    }

    /// bcdDevice rendered as `major.minor`
    pub fn device_version_string(&self) -> Option<String> {
        self.device_version.map(format_bcd)
    }

    /// Manufacturer string, or the vendor id in hex when unavailable
    pub fn display_manufacturer(&self) -> String {
        match self.manufacturer.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => format!("{:04x}", self.vendor_id),
        }
    }

    /// Product string, or the product id in hex when unavailable
    pub fn display_product(&self) -> String {
        match self.product.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => format!("{:04x}", self.product_id),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} ({}) {} {}",
            self.vendor_id,
            self.product_id,
            self.id(),
            self.display_manufacturer(),
            self.display_product()
        )
    }
}

fn format_bcd(bcd: u16) -> String {
    format!("{:x}.{:02x}", bcd >> 8, bcd & 0xff)
}

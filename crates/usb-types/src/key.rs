//! Device keys
//!
//! A [`DeviceKey`] is the identity the monitor uses to track a device across
//! events. Two algorithms exist:
//!
//! - **coarse**: vendor, product, class, subclass and protocol. Identical
//!   commodity units collapse onto the same key.
//! - **precise**: coarse plus serial number, manufacturer, configuration count
//!   and USB version where the OS exposes them.
//!
//! The coarse collision is intentional. Settings stored under a coarse key
//! apply to every unit of the same model.

use crate::descriptor::DeviceDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which key algorithm to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// vendor/product/class triple only
    Coarse,
    /// coarse plus serial, manufacturer, configuration count and USB version
    #[default]
    Precise,
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coarse => write!(f, "coarse"),
            Self::Precise => write!(f, "precise"),
        }
    }
}

/// Stable identity derived from a [`DeviceDescriptor`]
///
/// Equality and hashing use the key name only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Coarse key: `vid#pid#class#subclass#protocol`
    pub fn coarse(device: &DeviceDescriptor) -> Self {
        Self(coarse_name(device))
    }

    /// Coarse key extended with an externally read serial number
    ///
    /// Empty serials are ignored, yielding the plain coarse key.
    pub fn with_serial(device: &DeviceDescriptor, serial: Option<&str>) -> Self {
        let mut name = coarse_name(device);
        if let Some(serial) = serial.filter(|s| !s.is_empty()) {
            name.push('#');
            name.push_str(serial);
        }
        Self(name)
    }

    /// Precise key
    ///
    /// Missing strings render as empty fields so that the field count stays
    /// fixed and the coarse prefix is always the first five fields.
    pub fn precise(device: &DeviceDescriptor) -> Self {
        let mut name = coarse_name(device);
        name.push('#');
        name.push_str(device.serial_number.as_deref().unwrap_or(""));
        name.push('#');
        name.push_str(device.manufacturer.as_deref().unwrap_or(""));
        name.push('#');
        name.push_str(&device.num_configurations.to_string());
        name.push('#');
        if let Some(version) = device.usb_version_string() {
            name.push_str(&version);
        }
        name.push('#');
        Self(name)
    }

    /// Compute the key with the given algorithm
    pub fn compute(device: &DeviceDescriptor, mode: KeyMode) -> Self {
        match mode {
            KeyMode::Coarse => Self::coarse(device),
            KeyMode::Precise => Self::precise(device),
        }
    }

    /// The `#`-separated key name
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Stable 32-bit hash of the key name
    ///
    /// CRC-32 of the name bytes, identical across processes and platforms, so
    /// it can be used to persist per-device settings.
    pub fn hash32(&self) -> u32 {
        crc32fast::hash(self.0.as_bytes())
    }

    /// The coarse key this key was derived from
    pub fn to_coarse(&self) -> DeviceKey {
        let prefix: Vec<&str> = self.0.splitn(6, '#').take(5).collect();
        DeviceKey(prefix.join("#"))
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn coarse_name(device: &DeviceDescriptor) -> String {
    format!(
        "{}#{}#{}#{}#{}",
        device.vendor_id, device.product_id, device.class, device.subclass, device.protocol
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> DeviceDescriptor {
        DeviceDescriptor::new(0x8801, 0x1234).with_class(0xef, 0x02, 0x01)
    }

    #[test]
    fn test_coarse_name_format() {
        assert_eq!(DeviceKey::coarse(&camera()).name(), "34817#4660#239#2#1");
    }

    #[test]
    fn test_precise_name_format() {
        let mut device = camera().with_serial("SN1").with_strings("Acme", "Cam");
        device.usb_version = Some(0x0200);

        assert_eq!(
            DeviceKey::precise(&device).name(),
            "34817#4660#239#2#1#SN1#Acme#1#2.00#"
        );
    }

    #[test]
    fn test_with_serial_ignores_empty() {
        let device = camera();
        assert_eq!(DeviceKey::with_serial(&device, Some("")), DeviceKey::coarse(&device));
        assert_eq!(DeviceKey::with_serial(&device, None), DeviceKey::coarse(&device));
        assert_eq!(
            DeviceKey::with_serial(&device, Some("X9")).name(),
            "34817#4660#239#2#1#X9"
        );
    }

    #[test]
    fn test_identical_units_collide_coarsely() {
        let a = camera().with_serial("A").at(1, 2);
        let b = camera().with_serial("B").at(1, 3);

        assert_eq!(DeviceKey::coarse(&a), DeviceKey::coarse(&b));
        assert_ne!(DeviceKey::precise(&a), DeviceKey::precise(&b));
    }

    #[test]
    fn test_location_not_part_of_key() {
        let a = camera().at(1, 2);
        let b = camera().at(4, 9);
        assert_eq!(DeviceKey::precise(&a), DeviceKey::precise(&b));
    }

    #[test]
    fn test_hash_is_stable() {
        let key = DeviceKey::coarse(&camera());
        assert_eq!(key.hash32(), crc32fast::hash(b"34817#4660#239#2#1"));
        assert_eq!(key.hash32(), DeviceKey::coarse(&camera()).hash32());
    }

    #[test]
    fn test_to_coarse() {
        let device = camera().with_serial("SN1");
        assert_eq!(DeviceKey::precise(&device).to_coarse(), DeviceKey::coarse(&device));
        assert_eq!(DeviceKey::coarse(&device).to_coarse(), DeviceKey::coarse(&device));
    }

    #[test]
    fn test_key_mode_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: KeyMode,
        }
        let w: Wrapper = toml::from_str("mode = \"coarse\"").unwrap();
        assert_eq!(w.mode, KeyMode::Coarse);
        assert_eq!(KeyMode::default(), KeyMode::Precise);
    }
}

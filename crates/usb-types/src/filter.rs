//! Device filters
//!
//! A [`DeviceFilter`] is a predicate over a [`DeviceDescriptor`] with an
//! include/exclude polarity. A [`FilterSet`] narrows a raw enumeration into
//! the list of devices the monitor cares about.

use crate::descriptor::DeviceDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Device filter
///
/// Every field left as `None` is a wildcard. The class triple is checked
/// against the device first and then against every interface, since composite
/// devices (most UVC cameras among them) expose their function on an
/// interface rather than on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// USB Vendor ID
    #[serde(default)]
    pub vendor_id: Option<u16>,
    /// USB Product ID
    #[serde(default)]
    pub product_id: Option<u16>,
    /// Device or interface class
    #[serde(default)]
    pub class: Option<u8>,
    /// Device or interface subclass
    #[serde(default)]
    pub subclass: Option<u8>,
    /// Device or interface protocol
    #[serde(default)]
    pub protocol: Option<u8>,
    /// Manufacturer string
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Product string
    #[serde(default)]
    pub product: Option<String>,
    /// Serial number string
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Matching devices are excluded instead of included
    #[serde(default)]
    pub exclude: bool,
}

impl DeviceFilter {
    /// Filter matching every device
    pub fn any() -> Self {
        Self::default()
    }

    /// Build a filter from raw integer ids, negative meaning "don't care"
    ///
    /// Values out of range for the field width are treated as wildcards.
    pub fn from_ids(vendor_id: i32, product_id: i32, class: i32, subclass: i32, protocol: i32) -> Self {
        Self {
            vendor_id: u16::try_from(vendor_id).ok(),
            product_id: u16::try_from(product_id).ok(),
            class: u8::try_from(class).ok(),
            subclass: u8::try_from(subclass).ok(),
            protocol: u8::try_from(protocol).ok(),
            ..Self::default()
        }
    }

    /// Filter matching devices of the same model as `device`
    ///
    /// Strings are left unset so that every unit of the model matches.
    pub fn from_device(device: &DeviceDescriptor, exclude: bool) -> Self {
        Self {
            vendor_id: Some(device.vendor_id),
            product_id: Some(device.product_id),
            class: Some(device.class),
            subclass: Some(device.subclass),
            protocol: Some(device.protocol),
            exclude,
            ..Self::default()
        }
    }

    pub fn vendor(mut self, vendor_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    pub fn product(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn class(mut self, class: u8) -> Self {
        self.class = Some(class);
        self
    }

    pub fn subclass(mut self, subclass: u8) -> Self {
        self.subclass = Some(subclass);
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn product_name(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Turn this into an excluding filter
    pub fn excluding(mut self) -> Self {
        self.exclude = true;
        self
    }

    /// Check whether this filter matches the device, ignoring polarity
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        if self.vendor_id.is_some_and(|v| v != device.vendor_id) {
            return false;
        }
        if self.product_id.is_some_and(|p| p != device.product_id) {
            return false;
        }
        if !string_matches(self.manufacturer.as_deref(), device.manufacturer.as_deref())
            || !string_matches(self.product.as_deref(), device.product.as_deref())
            || !string_matches(self.serial_number.as_deref(), device.serial_number.as_deref())
        {
            return false;
        }

        if self.class_matches(device.class, device.subclass, device.protocol) {
            return true;
        }

        device
            .interfaces
            .iter()
            .any(|i| self.class_matches(i.class, i.subclass, i.protocol))
    }

    /// True only when the filter matches and is an excluding filter
    pub fn is_excluding(&self, device: &DeviceDescriptor) -> bool {
        self.exclude && self.matches(device)
    }

    fn class_matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class.is_none_or(|c| c == class)
            && self.subclass.is_none_or(|s| s == subclass)
            && self.protocol.is_none_or(|p| p == protocol)
    }
}

fn string_matches(wanted: Option<&str>, actual: Option<&str>) -> bool {
    match (wanted, actual) {
        (None, _) => true,
        (Some(w), Some(a)) => w == a,
        (Some(_), None) => false,
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field<T: fmt::LowerHex>(v: Option<T>, width: usize) -> String {
            match v {
                Some(v) => format!("{:0width$x}", v, width = width),
                None => "*".to_string(),
            }
        }
        if self.exclude {
            write!(f, "!")?;
        }
        write!(
            f,
            "{}:{} class={} sub={} proto={}",
            field(self.vendor_id, 4),
            field(self.product_id, 4),
            field(self.class, 2),
            field(self.subclass, 2),
            field(self.protocol, 2)
        )
    }
}

/// Error parsing a `VID:PID` filter pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error("invalid filter format '{0}', expected VID:PID (e.g. '0x1234:0x5678' or '0x1234:*')")]
    Format(String),

    #[error("invalid {field} '{value}', must be '*' or 0x-prefixed hex with 1-4 digits")]
    Id { field: &'static str, value: String },
}

impl FromStr for DeviceFilter {
    type Err = FilterParseError;

    /// Parse the `VID:PID` shorthand, where either side may be `*`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(FilterParseError::Format(s.to_string()));
        }

        Ok(Self {
            vendor_id: parse_id(parts[0], "VID")?,
            product_id: parse_id(parts[1], "PID")?,
            ..Self::default()
        })
    }
}

fn parse_id(value: &str, field: &'static str) -> Result<Option<u16>, FilterParseError> {
    if value == "*" {
        return Ok(None);
    }

    let err = || FilterParseError::Id {
        field,
        value: value.to_string(),
    };

    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(err)?;
    if hex.is_empty() || hex.len() > 4 {
        return Err(err());
    }

    u16::from_str_radix(hex, 16).map(Some).map_err(|_| err())
}

/// Ordered collection of filters used to narrow an enumeration
///
/// Resolution rule: with no filters every device is accepted. Otherwise a
/// device is accepted when at least one including filter matches it and no
/// excluding filter does. Exclusion always wins a tie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(Vec<DeviceFilter>);

impl FilterSet {
    pub fn new(filters: Vec<DeviceFilter>) -> Self {
        Self(filters)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceFilter> {
        self.0.iter()
    }

    pub fn push(&mut self, filter: DeviceFilter) {
        self.0.push(filter);
    }

    /// Remove every filter equal to `filter`, returning whether any was removed
    pub fn remove(&mut self, filter: &DeviceFilter) -> bool {
        let before = self.0.len();
        self.0.retain(|f| f != filter);
        self.0.len() != before
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Check whether a device passes this filter set
    pub fn accepts(&self, device: &DeviceDescriptor) -> bool {
        if self.0.is_empty() {
            return true;
        }

        let mut included = false;
        for filter in &self.0 {
            if filter.matches(device) {
                if filter.exclude {
                    return false;
                }
                included = true;
            }
        }
        included
    }

    /// Keep only the accepted devices, preserving enumeration order
    pub fn resolve<I>(&self, devices: I) -> Vec<DeviceDescriptor>
    where
        I: IntoIterator<Item = DeviceDescriptor>,
    {
        devices.into_iter().filter(|d| self.accepts(d)).collect()
    }

    pub fn into_vec(self) -> Vec<DeviceFilter> {
        self.0
    }
}

impl From<Vec<DeviceFilter>> for FilterSet {
    fn from(filters: Vec<DeviceFilter>) -> Self {
        Self(filters)
    }
}

impl FromIterator<DeviceFilter> for FilterSet {
    fn from_iter<I: IntoIterator<Item = DeviceFilter>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

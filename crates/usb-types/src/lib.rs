//! USB device value types for usb-monitor
//!
//! This crate defines the identity and matching types shared by the device
//! monitor and its consumers: descriptor snapshots as reported by the OS,
//! derived device keys, and include/exclude device filters.
//!
//! # Example
//!
//! ```
//! use usb_types::{DeviceDescriptor, DeviceFilter, DeviceKey, FilterSet};
//!
//! let camera = DeviceDescriptor::new(0x8801, 0x1234);
//! let filters = FilterSet::new(vec![DeviceFilter::any().vendor(0x8801)]);
//!
//! assert!(filters.accepts(&camera));
//! assert_eq!(DeviceKey::coarse(&camera).name(), "34817#4660#0#0#0");
//! ```

pub mod descriptor;
pub mod filter;
pub mod key;

pub use descriptor::{DeviceDescriptor, DeviceId, InterfaceDescriptor};
pub use filter::{DeviceFilter, FilterParseError, FilterSet};
pub use key::{DeviceKey, KeyMode};

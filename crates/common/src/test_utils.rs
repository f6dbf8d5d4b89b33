//! Test utilities for usb-monitor
//!
//! Provides descriptor factories and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_camera, create_mock_device};
//!
//! let device = create_mock_device(1, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//!
//! let camera = create_mock_camera(2);
//! assert_eq!(camera.interfaces.len(), 3);
//! ```

use std::future::Future;
use std::time::Duration;
use usb_types::{DeviceDescriptor, InterfaceDescriptor};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor id used by [`create_mock_camera`]
pub const MOCK_CAMERA_VENDOR: u16 = 0x8801;

/// Product id used by [`create_mock_camera`]
pub const MOCK_CAMERA_PRODUCT: u16 = 0x1234;

/// Create a mock DeviceDescriptor for testing
///
/// # Arguments
/// * `address` - Device address on bus 1, also used to derive the serial
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device;
///
/// let device = create_mock_device(3, 0x1234, 0x5678);
/// assert_eq!(device.device_address, 3);
/// assert_eq!(device.serial_number.as_deref(), Some("SN000003"));
/// ```
pub fn create_mock_device(address: u8, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    let mut device = DeviceDescriptor::new(vendor_id, product_id)
        .at(1, address)
        .with_strings(
            format!("Test Manufacturer {}", address),
            format!("Test Product {}", address),
        )
        .with_serial(format!("SN{:06}", address));
    device.usb_version = Some(0x0200);
    device.device_version = Some(0x0100);
    device
}

/// Create a mock DeviceDescriptor with specific USB class
pub fn create_mock_device_with_class(
    address: u8,
    vendor_id: u16,
    product_id: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> DeviceDescriptor {
    create_mock_device(address, vendor_id, product_id).with_class(class, subclass, protocol)
}

/// Create a mock UVC camera
///
/// Composite device (miscellaneous class / IAD) with a video control and a
/// video streaming interface, the streaming interface carrying one extra
/// alternate setting.
pub fn create_mock_camera(address: u8) -> DeviceDescriptor {
    create_mock_device_with_class(address, MOCK_CAMERA_VENDOR, MOCK_CAMERA_PRODUCT, 0xef, 0x02, 0x01)
        .with_interface(InterfaceDescriptor::new(0, 0x0e, 0x01, 0x00))
        .with_interface(InterfaceDescriptor::new(1, 0x0e, 0x02, 0x00))
        .with_interface(InterfaceDescriptor::new(1, 0x0e, 0x02, 0x00).with_alt_setting(1))
}

/// Create a mock HID device (keyboard/mouse)
pub fn create_mock_hid_device(address: u8) -> DeviceDescriptor {
    create_mock_device(address, 0x046d, 0xc52b)
        .with_interface(InterfaceDescriptor::new(0, 0x03, 0x01, 0x01))
}

/// Create a mock hub device
pub fn create_mock_hub_device(address: u8) -> DeviceDescriptor {
    create_mock_device_with_class(address, 0x05e3, 0x0608, 0x09, 0x00, 0x00)
}

/// Create a list of distinct mock devices on consecutive addresses
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_list;
///
/// let devices = create_mock_device_list(5);
/// assert_eq!(devices.len(), 5);
/// ```
pub fn create_mock_device_list(count: u8) -> Vec<DeviceDescriptor> {
    (1..=count)
        .map(|i| create_mock_device(i, 0x1000 + u16::from(i), 0x2000 + u16::from(i)))
        .collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

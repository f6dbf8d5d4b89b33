//! Common utilities for usb-monitor
//!
//! This crate provides functionality shared by the monitor core and its
//! binary: the error taxonomy, logging setup, and test helpers for building
//! device descriptors.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, HostError, Result};
pub use logging::{LOG_LEVELS, setup_logging, setup_test_logging};

//! Common error types
//!
//! [`HostError`] is what the OS boundary reports. [`Error`] is what the
//! consumer-facing API returns. OS failures met while requesting permission
//! or enumerating never reach a consumer as an `Error`; they become state
//! machine transitions instead.

use thiserror::Error;

/// Failure reported by the host USB subsystem
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("no such device (it may have been disconnected)")]
    NoDevice,

    #[error("access denied (insufficient permissions)")]
    Access,

    #[error("resource busy")]
    Busy,

    #[error("operation not supported on this platform")]
    NotSupported,

    #[error("host error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Any call on a torn-down monitor
    #[error("monitor already destroyed")]
    AlreadyDestroyed,

    /// Opening a device without permission
    #[error("no permission to access device")]
    AccessDenied,

    /// Operation on a closed control block
    #[error("control block already closed")]
    AlreadyClosed,

    /// Operation raced a physical detach
    #[error("device removed")]
    DeviceRemoved,

    /// The OS boundary failed while issuing a permission prompt
    #[error("permission request failed: {0}")]
    PermissionRequestFailed(String),

    #[error("interface {interface} (alt setting {alt_setting}) not found")]
    InterfaceNotFound { interface: u8, alt_setting: u8 },

    #[error("USB error: {0}")]
    Host(HostError),

    /// The worker task queue has shut down
    #[error("worker stopped")]
    WorkerStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NoDevice => Error::DeviceRemoved,
            HostError::Access => Error::AccessDenied,
            other => Error::Host(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

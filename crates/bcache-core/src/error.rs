//! Error types for the buffer cache
//!
//! Two very different failure classes exist:
//!
//! - `IoError`: an environmental fault (bad sector, missing driver). It is
//!   returned one level up as a value and never panics.
//! - Invariant violations (corrupted free list, double release). These go
//!   through [`fatal`], which logs and panics: continuing would hand out
//!   data belonging to an unrelated block.

use core::fmt;

use crate::id::DeviceId;

/// Result type for cache I/O operations
pub type IoResult<T> = Result<T, IoError>;

/// I/O failures surfaced to the filesystem layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The driver reported a failed read; the buffer is not up to date
    ReadFailed { device: DeviceId, block: u32 },

    /// The driver reported a failed write-back
    WriteFailed { device: DeviceId, block: u32 },

    /// No driver is registered for the device's major number
    NoDriver(DeviceId),
}

impl IoError {
    /// Device the failed operation targeted
    pub fn device(&self) -> DeviceId {
        match *self {
            IoError::ReadFailed { device, .. } => device,
            IoError::WriteFailed { device, .. } => device,
            IoError::NoDriver(device) => device,
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::ReadFailed { device, block } => {
                write!(f, "read failed: dev {}, block {}", device, block)
            }
            IoError::WriteFailed { device, block } => {
                write!(f, "write failed: dev {}, block {}", device, block)
            }
            IoError::NoDriver(device) => {
                write!(f, "nonexistent block-device {}", device)
            }
        }
    }
}

impl std::error::Error for IoError {}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Report an invariant violation and stop.
///
/// The message is logged at error level before panicking so that it reaches
/// stderr even when the panic is caught further up.
#[cold]
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    crate::kerror!("fatal: {}", msg);
    panic!("{}", msg)
}

//! Error types for raw device access

use std::io;
use thiserror::Error;

/// Raw device errors
#[derive(Debug, Error)]
pub enum HostError {
    /// Device path does not exist
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Not allowed to open the device
    #[error("Permission denied opening {0} (try running with elevated privileges)")]
    PermissionDenied(String),

    /// Failed to open device
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Seek, read or write failed
    #[error("I/O error on {path} at offset {offset:#x}: {source}")]
    Io {
        path: String,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Device not specified
    #[error("No device specified. Use dev=/dev/sdX")]
    NoDevice,
}

impl HostError {
    /// Classify an open failure
    pub fn open(path: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::DeviceNotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::OpenFailed {
                path: path.to_string(),
                source,
            },
        }
    }

    /// Collapse into the core error
    pub fn to_core(&self) -> c0flash_core::Error {
        match self {
            Self::DeviceNotFound(_) | Self::NoDevice => c0flash_core::Error::DeviceNotFound,
            Self::PermissionDenied(_) => c0flash_core::Error::PermissionDenied,
            Self::OpenFailed { .. } | Self::Io { .. } => c0flash_core::Error::IoError,
        }
    }
}

/// Result type for raw device access
pub type Result<T> = std::result::Result<T, HostError>;

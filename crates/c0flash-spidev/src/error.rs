//! Error types for spidev operations

use thiserror::Error;

/// Errors from the spidev bus
#[derive(Debug, Error)]
pub enum SpidevError {
    /// The device node could not be opened
    #[error("cannot open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// SPI_IOC_WR_MODE was refused
    #[error("cannot select SPI mode {mode}: {source}")]
    SetModeFailed {
        mode: u8,
        #[source]
        source: std::io::Error,
    },

    /// SPI_IOC_WR_BITS_PER_WORD was refused
    #[error("cannot use {bits}-bit words: {source}")]
    SetBitsPerWordFailed {
        bits: u8,
        #[source]
        source: std::io::Error,
    },

    /// SPI_IOC_WR_MAX_SPEED_HZ was refused
    #[error("cannot clock the bus at {speed} Hz: {source}")]
    SetSpeedFailed {
        speed: u32,
        #[source]
        source: std::io::Error,
    },

    /// SPI_IOC_MESSAGE failed
    #[error("spidev message failed: {0}")]
    TransferFailed(#[source] std::io::Error),

    /// Could not take or drop the bus lock
    #[error("cannot lock the bus: {0}")]
    LockFailed(#[source] std::io::Error),

    /// Bad argument to a bus call
    #[error("invalid argument: {0}")]
    InvalidParameter(String),

    /// No device node given
    #[error("no spidev node given (dev=/dev/spidevX.Y)")]
    NoDevice,
}

impl SpidevError {
    /// Collapse into the core error used by the transport
    pub fn to_core(&self) -> c0flash_core::Error {
        match self {
            Self::OpenFailed { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => c0flash_core::Error::DeviceNotFound,
                std::io::ErrorKind::PermissionDenied => c0flash_core::Error::PermissionDenied,
                _ => c0flash_core::Error::IoError,
            },
            Self::LockFailed(_) => c0flash_core::Error::BusBusy,
            _ => c0flash_core::Error::BusError,
        }
    }
}

/// Result type for spidev operations
pub type Result<T> = std::result::Result<T, SpidevError>;

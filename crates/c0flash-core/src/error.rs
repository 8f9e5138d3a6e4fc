//! Error types for c0flash-core
//!
//! This module provides a no_std compatible error type that can be used
//! throughout the crate. Variants are grouped by [`ErrorKind`] so front
//! ends can tell I/O trouble apart from protocol faults and bad images.

use core::fmt;

use crate::status::Mode;

/// Why the card refused a data block during a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRejection {
    /// Data response `0b0_101_1`: the card saw a CRC error in the block
    Crc,
    /// Data response `0b0_110_1`: the card failed to program the block
    Write,
    /// Any other data response token (masked with `0x1F`)
    Unknown(u8),
}

/// Broad classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device or file could not be accessed
    Io,
    /// The SD-over-SPI exchange failed
    Protocol,
    /// Image, metadata or argument content is malformed
    Data,
    /// The device is not in a state that allows the operation
    State,
}

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Bus errors
    /// SPI transfer failed
    BusError,
    /// SPI bus is already owned by someone else
    BusBusy,

    // SD protocol errors
    /// No acceptable response to a command within the retry budget
    ResponseTimeout {
        /// Command index that went unanswered
        cmd: u8,
    },
    /// The data start token never arrived
    StartTokenTimeout,
    /// CRC16 trailer of a received block does not match its data
    BlockCrcMismatch {
        /// CRC16 sent by the card
        received: u16,
        /// CRC16 computed over the received data
        computed: u16,
    },
    /// The card rejected a written block
    WriteRejected(WriteRejection),
    /// Command index has no known response format
    UnsupportedCommand(u8),

    // Address/size errors
    /// Block transfer length is zero or not a multiple of the block size
    InvalidLength,
    /// Offset does not fit the card's 32-bit byte address
    AddressOutOfRange,
    /// Buffer exceeds the size of the target region
    BufferTooLarge {
        /// Requested length
        len: usize,
        /// Size of the region
        max: usize,
    },

    // I/O errors
    /// Target device does not exist
    DeviceNotFound,
    /// Not allowed to open the target device
    PermissionDenied,
    /// I/O error occurred
    IoError,
    /// Device returned fewer bytes than requested
    ShortRead {
        /// Requested length
        expected: usize,
        /// Length actually returned
        actual: usize,
    },

    // Device state errors
    /// Status word does not identify a C0-microSD configuration
    NotC0Device,
    /// Device is in the middle of switching its boot configuration
    ConfigurationSwitching,
    /// Device is not running the configuration the operation needs
    WrongMode {
        /// Configuration the operation needs
        required: Mode,
    },
    /// Operation is not available on this device or bootloader version
    UnsupportedOperation,
    /// Compute core reported an invalid command
    InvalidCommand,
    /// Compute core reported a status value outside the protocol
    UnknownComputeStatus(u32),

    // Image/metadata errors
    /// Bitstream prefix delimiters were not found
    PrefixNotFound,
    /// No JSON metadata object in the image prefix
    MetadataNotFound,
    /// A required metadata field is absent
    MissingField(&'static str),
    /// A metadata field could not be parsed
    InvalidField(&'static str),
    /// Hex template could not be decoded
    InvalidHex,
    /// Image declares a type that does not belong in the target section
    ImageTypeMismatch,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BusError
            | Self::BusBusy
            | Self::DeviceNotFound
            | Self::PermissionDenied
            | Self::IoError
            | Self::ShortRead { .. } => ErrorKind::Io,
            Self::ResponseTimeout { .. }
            | Self::StartTokenTimeout
            | Self::BlockCrcMismatch { .. }
            | Self::WriteRejected(_)
            | Self::UnsupportedCommand(_) => ErrorKind::Protocol,
            Self::InvalidLength
            | Self::AddressOutOfRange
            | Self::BufferTooLarge { .. }
            | Self::PrefixNotFound
            | Self::MetadataNotFound
            | Self::MissingField(_)
            | Self::InvalidField(_)
            | Self::InvalidHex
            | Self::ImageTypeMismatch => ErrorKind::Data,
            Self::NotC0Device
            | Self::ConfigurationSwitching
            | Self::WrongMode { .. }
            | Self::UnsupportedOperation
            | Self::InvalidCommand
            | Self::UnknownComputeStatus(_) => ErrorKind::State,
        }
    }
}

impl fmt::Display for WriteRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc => write!(f, "data rejected due to a CRC error"),
            Self::Write => write!(f, "data rejected due to a write error"),
            Self::Unknown(token) => write!(f, "unrecognized data response 0x{:02X}", token),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BusError => write!(f, "SPI transfer failed"),
            Self::BusBusy => write!(f, "SPI bus is busy"),
            Self::ResponseTimeout { cmd } => write!(f, "no valid response to CMD{}", cmd),
            Self::StartTokenTimeout => write!(f, "timed out waiting for data start token"),
            Self::BlockCrcMismatch { received, computed } => write!(
                f,
                "block CRC mismatch: card sent 0x{:04X}, computed 0x{:04X}",
                received, computed
            ),
            Self::WriteRejected(reason) => write!(f, "write rejected: {}", reason),
            Self::UnsupportedCommand(cmd) => write!(f, "CMD{} is not supported", cmd),
            Self::InvalidLength => write!(f, "length must be a non-zero multiple of 512 bytes"),
            Self::AddressOutOfRange => write!(f, "address out of range"),
            Self::BufferTooLarge { len, max } => write!(
                f,
                "buffer size {} exceeds maximum allowed size of {} bytes",
                len, max
            ),
            Self::DeviceNotFound => write!(f, "device not found"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::IoError => write!(f, "I/O error"),
            Self::ShortRead { expected, actual } => {
                write!(f, "short read: expected {} bytes, got {}", expected, actual)
            }
            Self::NotC0Device => write!(f, "device is not a C0-microSD"),
            Self::ConfigurationSwitching => {
                write!(f, "device is switching configuration, power cycle it first")
            }
            Self::WrongMode { required } => write!(
                f,
                "device is not in {} mode. Switch to {} mode and try again",
                required, required
            ),
            Self::UnsupportedOperation => write!(f, "operation not supported by this device"),
            Self::InvalidCommand => write!(f, "device returned 'Unknown CMD'"),
            Self::UnknownComputeStatus(status) => {
                write!(f, "unknown compute status 0x{:08X}", status)
            }
            Self::PrefixNotFound => write!(f, "could not find bitstream prefix section"),
            Self::MetadataNotFound => write!(f, "no JSON metadata in bitstream prefix"),
            Self::MissingField(name) => write!(f, "metadata field '{}' is missing", name),
            Self::InvalidField(name) => write!(f, "metadata field '{}' is invalid", name),
            Self::InvalidHex => write!(f, "invalid hex string"),
            Self::ImageTypeMismatch => write!(f, "image type does not match the target section"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;

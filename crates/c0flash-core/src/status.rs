//! Configuration status word
//!
//! The card exposes a 12-byte status record at [`STATUS_OFFSET`]:
//!
//! | bytes  | content                                              |
//! |--------|------------------------------------------------------|
//! | 0..4   | configuration id, `SBLD` (bootloader) or `SSOC` (SoC) |
//! | 4..6   | major version, big-endian                            |
//! | 6..8   | minor version, big-endian                            |
//! | 8..12  | state word, big-endian; bit 0 set while switching    |

use core::fmt;

#[cfg(feature = "alloc")]
use crate::adapter::DeviceIo;
#[cfg(feature = "alloc")]
use crate::error::Result;

/// Offset of the configuration status record
pub const STATUS_OFFSET: u64 = 0x20000;
/// Size of the configuration status record
pub const STATUS_LEN: usize = 12;

/// Configuration id reported by the bootloader
pub const BOOTLOADER_ID: [u8; 4] = *b"SBLD";
/// Configuration id reported by the Signaloid SoC
pub const SOC_ID: [u8; 4] = *b"SSOC";

/// State word bit set while the boot configuration is being switched
pub const STATE_SWITCHING: u32 = 1 << 0;

/// Loaded configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Bootloader; protected sections can be reprogrammed
    Bootloader,
    /// Signaloid SoC
    Soc,
    /// Anything else
    Unknown,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "Bootloader"),
            Self::Soc => write!(f, "Signaloid Core"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major version; selects the memory map
    pub major: u16,
    /// Minor version
    pub minor: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Snapshot of the configuration status record
///
/// Nothing updates a snapshot in place; fetch a new one after any operation
/// that can change the device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Loaded configuration
    pub mode: Mode,
    /// Version of the loaded configuration
    pub version: Version,
    /// Raw state word
    pub state: u32,
}

impl DeviceStatus {
    /// Decode a raw status record
    pub fn decode(raw: &[u8; STATUS_LEN]) -> Self {
        let id = [raw[0], raw[1], raw[2], raw[3]];
        let mode = match id {
            BOOTLOADER_ID => Mode::Bootloader,
            SOC_ID => Mode::Soc,
            _ => Mode::Unknown,
        };
        Self {
            mode,
            version: Version {
                major: u16::from_be_bytes([raw[4], raw[5]]),
                minor: u16::from_be_bytes([raw[6], raw[7]]),
            },
            state: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }

    /// Whether a boot configuration switch is pending
    pub fn switching(&self) -> bool {
        self.state & STATE_SWITCHING != 0
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signaloid C0-microSD | Loaded configuration: {}", self.mode)?;
        if self.mode == Mode::Unknown {
            write!(f, " | Version: N/A")?;
        } else {
            write!(f, " | Version: {}", self.version)?;
        }
        if self.switching() {
            write!(f, " | State SWITCHING")
        } else {
            write!(f, " | State IDLE")
        }
    }
}

/// Read and decode the status record of `device`
#[cfg(feature = "alloc")]
pub fn read_status<D: DeviceIo + ?Sized>(device: &mut D) -> Result<DeviceStatus> {
    let raw = device.read_exact(STATUS_OFFSET, STATUS_LEN)?;
    let mut record = [0u8; STATUS_LEN];
    record.copy_from_slice(&raw);
    Ok(DeviceStatus::decode(&record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &[u8; 4], major: u16, minor: u16, state: u32) -> [u8; STATUS_LEN] {
        let mut raw = [0u8; STATUS_LEN];
        raw[..4].copy_from_slice(id);
        raw[4..6].copy_from_slice(&major.to_be_bytes());
        raw[6..8].copy_from_slice(&minor.to_be_bytes());
        raw[8..].copy_from_slice(&state.to_be_bytes());
        raw
    }

    #[test]
    fn decode_bootloader() {
        let status = DeviceStatus::decode(&record(b"SBLD", 2, 1, 0));
        assert_eq!(status.mode, Mode::Bootloader);
        assert_eq!(status.version, Version { major: 2, minor: 1 });
        assert!(!status.switching());
    }

    #[test]
    fn decode_switching_soc() {
        let status = DeviceStatus::decode(&record(b"SSOC", 1, 3, 0x8000_0001));
        assert_eq!(status.mode, Mode::Soc);
        assert!(status.switching());
    }

    #[test]
    fn unknown_id() {
        let status = DeviceStatus::decode(&[0xFF; STATUS_LEN]);
        assert_eq!(status.mode, Mode::Unknown);
    }
}

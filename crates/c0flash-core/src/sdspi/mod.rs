//! SD card protocol over SPI
//!
//! Only the subset of the SD command set needed for raw block access is
//! implemented: reset, initialization, block length, and single/multi
//! block reads and writes.

pub mod command;
pub mod crc;
pub mod transport;

pub use command::{CommandFrame, ResponseKind};
pub use crc::{crc16, crc7};
pub use transport::{SdSpi, SdSpiConfig};

/// Block size in bytes; every transfer is a multiple of this
pub const BLOCK_SIZE: usize = 512;

/// Start token for single-block reads/writes and every block of a multi-block read
pub const TOKEN_START_BLOCK: u8 = 0xFE;
/// Start token for each block of a multi-block write
pub const TOKEN_START_MULTI_WRITE: u8 = 0xFC;
/// Stop token ending a multi-block write
pub const TOKEN_STOP_TRAN: u8 = 0xFD;

/// Mask for the status bits of a data response token
pub const DATA_RESPONSE_MASK: u8 = 0x1F;
/// Data response: block accepted
pub const DATA_ACCEPTED: u8 = 0x05;
/// Data response: block rejected due to a CRC error
pub const DATA_CRC_ERROR: u8 = 0x0B;
/// Data response: block rejected due to a write error
pub const DATA_WRITE_ERROR: u8 = 0x0D;

/// Byte clocked while idle and returned by an idle card
pub const IDLE_BYTE: u8 = 0xFF;

/// R1: card is in idle state
pub const R1_IDLE_STATE: u8 = 0x01;
/// R1: card is ready
pub const R1_READY: u8 = 0x00;
/// R1: illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;
/// R1: command CRC error
pub const R1_COM_CRC_ERROR: u8 = 0x08;

//! SD command frames and response formats

use super::crc::crc7;

/// CMD0: GO_IDLE_STATE
pub const CMD0_GO_IDLE_STATE: u8 = 0;
/// CMD12: STOP_TRANSMISSION
pub const CMD12_STOP_TRANSMISSION: u8 = 12;
/// CMD16: SET_BLOCKLEN
pub const CMD16_SET_BLOCKLEN: u8 = 16;
/// CMD17: READ_SINGLE_BLOCK
pub const CMD17_READ_SINGLE_BLOCK: u8 = 17;
/// CMD18: READ_MULTIPLE_BLOCK
pub const CMD18_READ_MULTIPLE_BLOCK: u8 = 18;
/// CMD24: WRITE_BLOCK
pub const CMD24_WRITE_BLOCK: u8 = 24;
/// CMD25: WRITE_MULTIPLE_BLOCK
pub const CMD25_WRITE_MULTIPLE_BLOCK: u8 = 25;
/// CMD55: APP_CMD, prefix of every application command
pub const CMD55_APP_CMD: u8 = 55;
/// ACMD41: SD_SEND_OP_COND
pub const ACMD41_SD_SEND_OP_COND: u8 = 41;

/// ACMD41 argument with the host capacity support bit set
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// Response format of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// One status byte
    R1,
    /// One status byte followed by busy signalling
    R1b,
    /// Two status bytes
    R2,
    /// R1 followed by the 32-bit OCR
    R3,
    /// R1 followed by 32 bits of interface condition
    R7,
}

impl ResponseKind {
    /// Total response length in bytes, excluding busy signalling
    pub const fn size(self) -> usize {
        match self {
            Self::R1 | Self::R1b => 1,
            Self::R2 => 2,
            Self::R3 | Self::R7 => 5,
        }
    }

    /// Response format of standard command `index`, if it is supported in SPI mode
    pub const fn for_command(index: u8) -> Option<Self> {
        match index {
            0 | 1 | 6 | 9 | 10 | 16 | 17 | 18 | 24 | 25 | 27 | 30 | 32 | 33 | 42 | 55 | 56
            | 59 => Some(Self::R1),
            12 | 28 | 29 | 38 => Some(Self::R1b),
            13 => Some(Self::R2),
            8 => Some(Self::R7),
            58 => Some(Self::R3),
            _ => None,
        }
    }

    /// Response format of application command `index`
    pub const fn for_app_command(index: u8) -> Option<Self> {
        match index {
            13 => Some(Self::R2),
            22 | 23 | 41 | 42 | 51 => Some(Self::R1),
            _ => None,
        }
    }
}

/// A 6-byte SD command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; 6]);

impl CommandFrame {
    /// Build the frame for command `index` with argument `arg`
    pub fn new(index: u8, arg: u32) -> Self {
        let mut frame = [0u8; 6];
        frame[0] = 0x40 | (index & 0x3F);
        frame[1..5].copy_from_slice(&arg.to_be_bytes());
        frame[5] = (crc7(&frame[..5]) << 1) | 1;
        Self(frame)
    }

    /// Command index carried by the frame
    pub fn index(&self) -> u8 {
        self.0[0] & 0x3F
    }

    /// Argument carried by the frame
    pub fn argument(&self) -> u32 {
        u32::from_be_bytes([self.0[1], self.0[2], self.0[3], self.0[4]])
    }

    /// Raw frame bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse a received frame, checking start bits, CRC and end bit
    pub fn parse(bytes: &[u8; 6]) -> Option<Self> {
        if bytes[0] & 0xC0 != 0x40 || bytes[5] & 1 != 1 {
            return None;
        }
        if bytes[5] >> 1 != crc7(&bytes[..5]) {
            return None;
        }
        Some(Self(*bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd0_frame() {
        let frame = CommandFrame::new(CMD0_GO_IDLE_STATE, 0);
        assert_eq!(frame.as_bytes(), &[0x40, 0x00, 0x00, 0x00, 0x00, 0x95]);
    }

    #[test]
    fn argument_is_big_endian() {
        let frame = CommandFrame::new(CMD17_READ_SINGLE_BLOCK, 0x0002_0000);
        assert_eq!(&frame.as_bytes()[..5], &[0x51, 0x00, 0x02, 0x00, 0x00]);
        assert_eq!(frame.index(), 17);
        assert_eq!(frame.argument(), 0x0002_0000);
    }

    #[test]
    fn parse_rejects_corruption() {
        let frame = CommandFrame::new(CMD16_SET_BLOCKLEN, 512);
        assert_eq!(CommandFrame::parse(frame.as_bytes()), Some(frame));

        let mut corrupted = *frame.as_bytes();
        corrupted[3] ^= 0x01;
        assert_eq!(CommandFrame::parse(&corrupted), None);
    }

    #[test]
    fn response_table() {
        assert_eq!(ResponseKind::for_command(0), Some(ResponseKind::R1));
        assert_eq!(ResponseKind::for_command(8), Some(ResponseKind::R7));
        assert_eq!(ResponseKind::for_command(12), Some(ResponseKind::R1b));
        assert_eq!(ResponseKind::for_command(13), Some(ResponseKind::R2));
        assert_eq!(ResponseKind::for_command(58), Some(ResponseKind::R3));
        assert_eq!(ResponseKind::for_command(2), None);
        assert_eq!(ResponseKind::for_command(63), None);
        assert_eq!(ResponseKind::for_app_command(41), Some(ResponseKind::R1));
        assert_eq!(ResponseKind::for_app_command(13), Some(ResponseKind::R2));
        assert_eq!(ResponseKind::for_app_command(55), None);
        assert_eq!(ResponseKind::R7.size(), 5);
    }
}

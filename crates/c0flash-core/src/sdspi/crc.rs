//! CRC7 and CRC16 for SD commands and data blocks
//!
//! Both checksums are computed one bit at a time, most significant bit
//! first, exactly as the shift registers in the SD physical layer do.

const CRC7_POLY: u8 = 0x09;
const CRC16_POLY: u16 = 0x1021;

/// CRC7 (x^7 + x^3 + 1) over `data`, as used in command frames
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        for bit in (0..8).rev() {
            let feedback = ((crc >> 6) ^ (byte >> bit)) & 1;
            crc = (crc << 1) & 0x7F;
            if feedback != 0 {
                crc ^= CRC7_POLY;
            }
        }
    }
    crc
}

/// CRC16 (x^16 + x^12 + x^5 + 1) over `data`, as used in data blocks
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        for bit in (0..8).rev() {
            let feedback = ((crc >> 15) ^ u16::from(byte >> bit)) & 1;
            crc <<= 1;
            if feedback != 0 {
                crc ^= CRC16_POLY;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc7_cmd0() {
        assert_eq!(crc7(&[0x40, 0x00, 0x00, 0x00, 0x00]), 0x4A);
    }

    #[test]
    fn crc7_cmd8() {
        // CMD8 with the 0x1AA check pattern ends in 0x87
        assert_eq!((crc7(&[0x48, 0x00, 0x00, 0x01, 0xAA]) << 1) | 1, 0x87);
    }

    #[test]
    fn crc16_erased_block() {
        assert_eq!(crc16(&[0xFF; 512]).to_be_bytes(), [0x7F, 0xA1]);
    }

    #[test]
    fn crc16_matches_table_driven() {
        let table = ::crc::Crc::<u16>::new(&::crc::CRC_16_XMODEM);
        let data: [u8; 64] = core::array::from_fn(|i| (i * 37 + 11) as u8);
        assert_eq!(crc16(&data), table.checksum(&data));
    }

    #[test]
    fn crc16_is_deterministic() {
        let data: [u8; 512] = core::array::from_fn(|i| (i ^ (i >> 3)) as u8);
        assert_eq!(crc16(&data), crc16(&data));
    }

    #[test]
    fn crc16_detects_single_bit_flips() {
        let data: [u8; 512] = core::array::from_fn(|i| (i * 7) as u8);
        let reference = crc16(&data);
        for byte in [0usize, 1, 255, 511] {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[byte] ^= 1 << bit;
                assert_ne!(crc16(&flipped), reference, "byte {} bit {}", byte, bit);
            }
        }
    }
}

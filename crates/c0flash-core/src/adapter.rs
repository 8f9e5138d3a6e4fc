//! Uniform offset-addressed device access
//!
//! Controllers talk to the card only through [`DeviceIo`]. Host backends
//! implement it over a raw block device; [`SdBlockDevice`] implements it
//! over the SD-over-SPI transport.

use alloc::vec;
use alloc::vec::Vec;

use crate::bus::SpiBus;
use crate::error::{Error, Result};
use crate::sdspi::{SdSpi, BLOCK_SIZE};

/// Byte-addressed read/write access to a card
pub trait DeviceIo {
    /// Read up to `len` bytes at `offset`
    ///
    /// Backends may return fewer bytes when the device ends early.
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize>;

    /// Delay for the specified number of microseconds
    fn delay_us(&mut self, us: u32);

    /// Read exactly `len` bytes at `offset`
    fn read_exact(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.read(offset, len)?;
        if data.len() != len {
            return Err(Error::ShortRead {
                expected: len,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Read a little-endian 32-bit register
    fn read_u32(&mut self, offset: u64) -> Result<u32> {
        let data = self.read_exact(offset, 4)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Write a little-endian 32-bit register
    fn write_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes()).map(|_| ())
    }
}

impl<T: DeviceIo + ?Sized> DeviceIo for &mut T {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read(offset, len)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        (**self).write(offset, data)
    }

    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us)
    }
}

// Blanket impl for boxed devices to allow trait objects
impl DeviceIo for alloc::boxed::Box<dyn DeviceIo + Send> {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read(offset, len)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        (**self).write(offset, data)
    }

    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us)
    }
}

/// [`DeviceIo`] over an SD card in SPI mode
///
/// The card is byte addressed; offsets are passed through as the block
/// command argument. Reads are rounded up to whole blocks and trimmed,
/// writes are zero-padded to the next block boundary.
pub struct SdBlockDevice<B: SpiBus> {
    sd: SdSpi<B>,
}

impl<B: SpiBus> SdBlockDevice<B> {
    /// Wrap an already initialized transport
    pub fn new(sd: SdSpi<B>) -> Self {
        Self { sd }
    }

    /// Initialize the card and wrap the transport
    pub fn init(mut sd: SdSpi<B>) -> Result<Self> {
        sd.init()?;
        Ok(Self { sd })
    }

    /// Access the transport
    pub fn transport(&mut self) -> &mut SdSpi<B> {
        &mut self.sd
    }

    /// Release the transport
    pub fn into_inner(self) -> SdSpi<B> {
        self.sd
    }
}

fn card_address(offset: u64) -> Result<u32> {
    u32::try_from(offset).map_err(|_| Error::AddressOutOfRange)
}

impl<B: SpiBus> DeviceIo for SdBlockDevice<B> {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let blocks = len.div_ceil(BLOCK_SIZE);
        let mut buf = vec![0u8; blocks * BLOCK_SIZE];
        self.sd.read_blocks(card_address(offset)?, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let addr = card_address(offset)?;
        let blocks = data.len().div_ceil(BLOCK_SIZE);
        let written = if data.len() % BLOCK_SIZE == 0 {
            self.sd.write_blocks(addr, data)?
        } else {
            let mut padded = vec![0u8; blocks * BLOCK_SIZE];
            padded[..data.len()].copy_from_slice(data);
            self.sd.write_blocks(addr, &padded)?
        };
        Ok((written * BLOCK_SIZE).min(data.len()))
    }

    fn delay_us(&mut self, us: u32) {
        self.sd.delay_us(us)
    }
}

//! SD card in SPI mode
//!
//! [`SdCardEmulator`] sits on the card side of an [`SpiBus`]: it parses the
//! command frames and data tokens the host clocks in and queues the bytes
//! a card would clock back. Block reads and writes land on a backing
//! [`DeviceIo`], so a [`DummyCard`](crate::DummyCard) can be reached
//! through the whole SD-over-SPI stack.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use c0flash_core::adapter::DeviceIo;
use c0flash_core::bus::SpiBus;
use c0flash_core::error::{Error, Result};
use c0flash_core::sdspi::command::{
    ACMD41_SD_SEND_OP_COND, CMD0_GO_IDLE_STATE, CMD12_STOP_TRANSMISSION, CMD16_SET_BLOCKLEN,
    CMD17_READ_SINGLE_BLOCK, CMD18_READ_MULTIPLE_BLOCK, CMD24_WRITE_BLOCK,
    CMD25_WRITE_MULTIPLE_BLOCK, CMD55_APP_CMD,
};
use c0flash_core::sdspi::{
    crc16, CommandFrame, BLOCK_SIZE, IDLE_BYTE, R1_COM_CRC_ERROR, R1_IDLE_STATE,
    R1_ILLEGAL_COMMAND, R1_READY, TOKEN_START_BLOCK, TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN,
};

/// R1 parameter error bit
const R1_PARAMETER_ERROR: u8 = 0x40;
/// Data error token sent instead of a start token when a read fails
const TOKEN_READ_ERROR: u8 = 0x01;
/// Data responses with the always-one upper bits set
const RESPONSE_ACCEPTED: u8 = 0xE5;
const RESPONSE_CRC_ERROR: u8 = 0xEB;
const RESPONSE_WRITE_ERROR: u8 = 0xED;

/// Card behaviour knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdCardConfig {
    /// ACMD41 polls answered with "idle" before the card reports ready
    pub init_polls: u32,
    /// Busy bytes clocked out after each programmed block
    pub busy_bytes: usize,
}

impl Default for SdCardConfig {
    fn default() -> Self {
        Self {
            init_polls: 2,
            busy_bytes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receive {
    /// Waiting for a command frame
    Command,
    /// Waiting for a data token of a write
    DataToken { addr: u64, multi: bool },
    /// Collecting a data block and its CRC
    DataBlock { addr: u64, multi: bool },
}

/// SD card emulator implementing the host-facing [`SpiBus`]
pub struct SdCardEmulator<D: DeviceIo> {
    backing: D,
    config: SdCardConfig,
    selected: bool,
    locked: bool,
    ready: bool,
    app_command: bool,
    init_polls_left: u32,
    state: Receive,
    input: Vec<u8>,
    output: VecDeque<u8>,
    streaming: Option<u64>,
    frames: usize,
}

impl<D: DeviceIo> SdCardEmulator<D> {
    /// Create a powered-up card in front of `backing`
    pub fn new(backing: D) -> Self {
        Self::with_config(backing, SdCardConfig::default())
    }

    /// Create a card with explicit behaviour
    pub fn with_config(backing: D, config: SdCardConfig) -> Self {
        Self {
            backing,
            config,
            selected: false,
            locked: false,
            ready: false,
            app_command: false,
            init_polls_left: config.init_polls,
            state: Receive::Command,
            input: Vec::new(),
            output: VecDeque::new(),
            streaming: None,
            frames: 0,
        }
    }

    /// Whether the card left the idle state
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether chip select is asserted
    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Whether the bus lock is held
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Number of valid command frames received
    pub fn frames_received(&self) -> usize {
        self.frames
    }

    /// Access the backing device
    pub fn backing_mut(&mut self) -> &mut D {
        &mut self.backing
    }

    /// Release the backing device
    pub fn into_inner(self) -> D {
        self.backing
    }

    fn r1_base(&self) -> u8 {
        if self.ready {
            R1_READY
        } else {
            R1_IDLE_STATE
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        // One byte of command response time
        self.output.push_back(IDLE_BYTE);
        self.output.extend(bytes);
    }

    fn queue_block(&mut self, addr: u64) -> bool {
        match self.backing.read(addr, BLOCK_SIZE) {
            Ok(mut block) => {
                block.resize(BLOCK_SIZE, 0);
                self.output.push_back(IDLE_BYTE);
                self.output.push_back(TOKEN_START_BLOCK);
                self.output.extend(&block);
                self.output.extend(crc16(&block).to_be_bytes());
                true
            }
            Err(e) => {
                log::debug!("sdcard: Read at 0x{:08X} failed: {}", addr, e);
                self.output.push_back(TOKEN_READ_ERROR);
                false
            }
        }
    }

    fn queue_busy(&mut self) {
        self.output
            .extend(core::iter::repeat(0x00).take(self.config.busy_bytes.max(1)));
    }

    fn handle_frame(&mut self, raw: &[u8; 6]) {
        let Some(frame) = CommandFrame::parse(raw) else {
            log::debug!("sdcard: Command frame CRC error");
            self.respond(&[R1_COM_CRC_ERROR | self.r1_base()]);
            return;
        };
        self.frames += 1;
        let index = frame.index();
        let arg = frame.argument();
        let app = core::mem::take(&mut self.app_command);
        log::trace!("sdcard: {}CMD{} arg=0x{:08X}", if app { "A" } else { "" }, index, arg);

        if app && index == ACMD41_SD_SEND_OP_COND {
            if self.init_polls_left > 0 {
                self.init_polls_left -= 1;
            } else {
                self.ready = true;
            }
            let r1 = self.r1_base();
            self.respond(&[r1]);
            return;
        }

        match index {
            CMD0_GO_IDLE_STATE => {
                self.ready = false;
                self.init_polls_left = self.config.init_polls;
                self.streaming = None;
                self.respond(&[R1_IDLE_STATE]);
            }
            CMD55_APP_CMD => {
                self.app_command = true;
                let r1 = self.r1_base();
                self.respond(&[r1]);
            }
            CMD16_SET_BLOCKLEN => {
                let r1 = if arg as usize == BLOCK_SIZE {
                    self.r1_base()
                } else {
                    self.r1_base() | R1_PARAMETER_ERROR
                };
                self.respond(&[r1]);
            }
            CMD12_STOP_TRANSMISSION => {
                self.streaming = None;
                self.output.clear();
                // Stuff byte, R1, then busy
                self.output.push_back(IDLE_BYTE);
                self.respond(&[self.r1_base()]);
                self.queue_busy();
            }
            CMD17_READ_SINGLE_BLOCK | CMD18_READ_MULTIPLE_BLOCK
            | CMD24_WRITE_BLOCK | CMD25_WRITE_MULTIPLE_BLOCK
                if !self.ready =>
            {
                self.respond(&[R1_ILLEGAL_COMMAND | R1_IDLE_STATE]);
            }
            CMD17_READ_SINGLE_BLOCK => {
                self.respond(&[R1_READY]);
                self.queue_block(arg as u64);
            }
            CMD18_READ_MULTIPLE_BLOCK => {
                self.respond(&[R1_READY]);
                self.streaming = Some(arg as u64);
            }
            CMD24_WRITE_BLOCK | CMD25_WRITE_MULTIPLE_BLOCK => {
                self.respond(&[R1_READY]);
                self.state = Receive::DataToken {
                    addr: arg as u64,
                    multi: index == CMD25_WRITE_MULTIPLE_BLOCK,
                };
            }
            _ => {
                log::debug!("sdcard: Unsupported CMD{}", index);
                let r1 = self.r1_base() | R1_ILLEGAL_COMMAND;
                self.respond(&[r1]);
            }
        }
    }

    fn handle_block(&mut self, addr: u64, multi: bool) {
        let (block, trailer) = self.input.split_at(BLOCK_SIZE);
        let received = u16::from_be_bytes([trailer[0], trailer[1]]);
        let response = if received != crc16(block) {
            RESPONSE_CRC_ERROR
        } else {
            match self.backing.write(addr, block) {
                Ok(_) => RESPONSE_ACCEPTED,
                Err(e) => {
                    log::debug!("sdcard: Write at 0x{:08X} failed: {}", addr, e);
                    RESPONSE_WRITE_ERROR
                }
            }
        };
        self.input.clear();
        self.output.push_back(response);
        if response == RESPONSE_ACCEPTED {
            self.queue_busy();
        }
        self.state = if multi && response == RESPONSE_ACCEPTED {
            Receive::DataToken {
                addr: addr + BLOCK_SIZE as u64,
                multi,
            }
        } else {
            Receive::Command
        };
    }

    fn receive(&mut self, byte: u8) {
        match self.state {
            Receive::Command => {
                if self.input.is_empty() && byte & 0xC0 != 0x40 {
                    return;
                }
                self.input.push(byte);
                if self.input.len() == 6 {
                    let mut raw = [0u8; 6];
                    raw.copy_from_slice(&self.input);
                    self.input.clear();
                    self.handle_frame(&raw);
                }
            }
            Receive::DataToken { addr, multi } => match byte {
                TOKEN_START_BLOCK if !multi => self.state = Receive::DataBlock { addr, multi },
                TOKEN_START_MULTI_WRITE if multi => {
                    self.state = Receive::DataBlock { addr, multi }
                }
                TOKEN_STOP_TRAN if multi => {
                    self.state = Receive::Command;
                    self.output.push_back(IDLE_BYTE);
                    self.queue_busy();
                }
                _ => {}
            },
            Receive::DataBlock { addr, multi } => {
                self.input.push(byte);
                if self.input.len() == BLOCK_SIZE + 2 {
                    self.handle_block(addr, multi);
                }
            }
        }
    }

    fn transmit(&mut self) -> u8 {
        if self.output.is_empty() {
            if let Some(addr) = self.streaming {
                self.streaming = if self.queue_block(addr) {
                    Some(addr + BLOCK_SIZE as u64)
                } else {
                    None
                };
            }
        }
        self.output.pop_front().unwrap_or(IDLE_BYTE)
    }
}

impl<D: DeviceIo> SpiBus for SdCardEmulator<D> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.selected {
            return Ok(());
        }
        for &byte in data {
            self.receive(byte);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        for b in buf.iter_mut() {
            *b = if self.selected {
                self.transmit()
            } else {
                IDLE_BYTE
            };
        }
        Ok(())
    }

    fn assert_cs(&mut self) -> Result<()> {
        self.selected = true;
        Ok(())
    }

    fn release_cs(&mut self) -> Result<()> {
        self.selected = false;
        if self.state == Receive::Command {
            self.input.clear();
        }
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Err(Error::BusBusy);
        }
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.locked = false;
        Ok(())
    }

    fn delay_us(&mut self, us: u32) {
        self.backing.delay_us(us)
    }
}

/// Backing store of plain memory for exercising the transport alone
pub struct MemoryBacking {
    data: Vec<u8>,
}

impl MemoryBacking {
    /// Create `size` bytes of zeroed memory
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    /// Get a reference to the memory
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl DeviceIo for MemoryBacking {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = usize::try_from(offset).map_err(|_| Error::AddressOutOfRange)?;
        let end = start.checked_add(len).ok_or(Error::AddressOutOfRange)?;
        self.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(Error::AddressOutOfRange)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let start = usize::try_from(offset).map_err(|_| Error::AddressOutOfRange)?;
        let end = start.checked_add(data.len()).ok_or(Error::AddressOutOfRange)?;
        self.data
            .get_mut(start..end)
            .ok_or(Error::AddressOutOfRange)?
            .copy_from_slice(data);
        Ok(data.len())
    }

    fn delay_us(&mut self, _us: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::DummyCard;
    use c0flash_core::adapter::SdBlockDevice;
    use c0flash_core::bootloader::Controller;
    use c0flash_core::flash::NoProgress;
    use c0flash_core::memory_map::BOOTLOADER_V2;
    use c0flash_core::sdspi::{SdSpi, SdSpiConfig};
    use c0flash_core::status::Mode;

    fn card(size: usize) -> SdSpi<SdCardEmulator<MemoryBacking>> {
        SdSpi::new(SdCardEmulator::new(MemoryBacking::new(size)))
    }

    #[test]
    fn init_reaches_ready() {
        let mut sd = card(4096);
        sd.init().unwrap();
        let bus = sd.into_inner();
        assert!(bus.is_ready());
        assert!(!bus.is_selected());
        assert!(!bus.is_locked());
    }

    #[test]
    fn init_gives_up_on_a_card_that_stays_idle() {
        let config = SdCardConfig {
            init_polls: 1000,
            ..Default::default()
        };
        let bus = SdCardEmulator::with_config(MemoryBacking::new(4096), config);
        let mut sd = SdSpi::with_config(
            bus,
            SdSpiConfig {
                timeout: 8,
                dummy_bytes: 2,
            },
        );
        assert_eq!(
            sd.init(),
            Err(Error::ResponseTimeout {
                cmd: ACMD41_SD_SEND_OP_COND
            })
        );
        assert!(!sd.bus_mut().is_locked());
    }

    #[test]
    fn single_block_round_trip() {
        let mut sd = card(4096);
        sd.init().unwrap();
        let block: Vec<u8> = (0..BLOCK_SIZE).map(|i| i as u8).collect();
        assert_eq!(sd.write_blocks(1024, &block), Ok(1));

        let mut buf = vec![0u8; BLOCK_SIZE];
        sd.read_blocks(1024, &mut buf).unwrap();
        assert_eq!(buf, block);
        assert_eq!(&sd.into_inner().into_inner().data()[1024..1536], &block[..]);
    }

    #[test]
    fn multi_block_round_trip() {
        let mut sd = card(8192);
        sd.init().unwrap();
        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i * 7) as u8).collect();
        assert_eq!(sd.write_blocks(512, &data), Ok(3));

        let mut buf = vec![0u8; 3 * BLOCK_SIZE];
        sd.read_blocks(512, &mut buf).unwrap();
        assert_eq!(buf, data);

        // The card is still usable after the stop transmission
        let mut first = vec![0u8; BLOCK_SIZE];
        sd.read_blocks(512, &mut first).unwrap();
        assert_eq!(first, data[..BLOCK_SIZE]);
    }

    #[test]
    fn read_past_end_reports_missing_token() {
        let mut sd = card(1024);
        sd.init().unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(
            sd.read_blocks(4096, &mut buf),
            Err(Error::StartTokenTimeout)
        );
    }

    #[test]
    fn byte_access_through_block_device() {
        let mut dev = SdBlockDevice::init(card(4096)).unwrap();
        assert_eq!(dev.write(512, b"hello"), Ok(5));
        assert_eq!(dev.read(512, 5).unwrap(), b"hello");
        // Partial block writes are zero padded
        assert_eq!(dev.read(517, 4).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn controller_over_spi() {
        let sd = SdSpi::new(SdCardEmulator::new(DummyCard::new_default()));
        let dev = SdBlockDevice::init(sd).unwrap();
        let mut c = Controller::connect(dev, false).unwrap();
        assert_eq!(c.map(), &BOOTLOADER_V2);
        assert_eq!(c.get_status().unwrap().mode, Mode::Bootloader);
        assert_eq!(c.get_serial_number().unwrap(), "C0DUMMY0000001");

        let image = vec![0xA5u8; 2 * BLOCK_SIZE];
        assert_eq!(
            c.flash_and_verify_with_progress(
                &image,
                BOOTLOADER_V2.user_bitstream_offset,
                2,
                false,
                &mut NoProgress
            ),
            Ok(true)
        );
    }
}

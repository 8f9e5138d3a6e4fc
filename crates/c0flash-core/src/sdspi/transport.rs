//! Block transport over an [`SpiBus`]
//!
//! Every multi-frame exchange runs inside a [`Session`], which owns the bus
//! lock and chip-select for its lifetime. Bounded loops (command responses,
//! start tokens) are limited by [`SdSpiConfig::timeout`]. The busy-wait after
//! a programmed block has no bound: it ends when the card releases the bus.

use super::command::{
    CommandFrame, ResponseKind, ACMD41_HCS, ACMD41_SD_SEND_OP_COND, CMD0_GO_IDLE_STATE,
    CMD12_STOP_TRANSMISSION, CMD16_SET_BLOCKLEN, CMD17_READ_SINGLE_BLOCK,
    CMD18_READ_MULTIPLE_BLOCK, CMD24_WRITE_BLOCK, CMD25_WRITE_MULTIPLE_BLOCK, CMD55_APP_CMD,
};
use super::crc::crc16;
use super::{
    BLOCK_SIZE, DATA_ACCEPTED, DATA_CRC_ERROR, DATA_RESPONSE_MASK, DATA_WRITE_ERROR, IDLE_BYTE,
    R1_IDLE_STATE, R1_READY, TOKEN_START_BLOCK, TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN,
};
use crate::bus::{BusGuard, SpiBus};
use crate::error::{Error, Result, WriteRejection};

const IDLE_FILL: [u8; 16] = [IDLE_BYTE; 16];

/// Transport tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdSpiConfig {
    /// Retry budget for command responses and data start tokens
    pub timeout: u32,
    /// Idle bytes clocked before each command frame and data block
    pub dummy_bytes: usize,
}

impl Default for SdSpiConfig {
    fn default() -> Self {
        Self {
            timeout: 250,
            dummy_bytes: 2,
        }
    }
}

/// A decoded command response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    kind: ResponseKind,
    bytes: [u8; 5],
}

impl Response {
    /// Response format
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// The R1 status byte every response starts with
    pub fn r1(&self) -> u8 {
        self.bytes[0]
    }

    /// Trailing bytes after R1 (second R2 byte, or the R3/R7 payload)
    pub fn trailer(&self) -> &[u8] {
        &self.bytes[1..self.kind.size()]
    }
}

/// SD card driven over SPI
pub struct SdSpi<B: SpiBus> {
    bus: B,
    config: SdSpiConfig,
}

impl<B: SpiBus> SdSpi<B> {
    /// Create a transport with the default configuration
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, SdSpiConfig::default())
    }

    /// Create a transport with an explicit configuration
    pub fn with_config(bus: B, config: SdSpiConfig) -> Self {
        Self { bus, config }
    }

    /// Transport configuration
    pub fn config(&self) -> &SdSpiConfig {
        &self.config
    }

    /// Access the underlying bus
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Release the underlying bus
    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Delay for the specified number of microseconds
    pub fn delay_us(&mut self, us: u32) {
        self.bus.delay_us(us)
    }

    /// Bring the card from power-up into SPI data-transfer mode
    ///
    /// CMD0 until the card reports idle, ACMD41 with host capacity support
    /// until it reports ready, then CMD16 to fix the block length at 512.
    pub fn init(&mut self) -> Result<()> {
        let mut session = Session::open(&mut self.bus, self.config)?;
        session.command(CMD0_GO_IDLE_STATE, 0, &[R1_IDLE_STATE])?;
        session.app_command(ACMD41_SD_SEND_OP_COND, ACMD41_HCS, &[R1_READY])?;
        session.command(CMD16_SET_BLOCKLEN, BLOCK_SIZE as u32, &[R1_READY])?;
        log::debug!("SD card initialized");
        Ok(())
    }

    /// Send a standard command and wait for an R1 byte in `accept`
    ///
    /// An empty `accept` takes the first response the card gives.
    pub fn send_cmd(&mut self, index: u8, arg: u32, accept: &[u8]) -> Result<Response> {
        Session::open(&mut self.bus, self.config)?.command(index, arg, accept)
    }

    /// Send an application command, each attempt preceded by CMD55
    pub fn send_acmd(&mut self, index: u8, arg: u32, accept: &[u8]) -> Result<Response> {
        Session::open(&mut self.bus, self.config)?.app_command(index, arg, accept)
    }

    /// Read `buf.len() / 512` blocks starting at byte address `addr`
    pub fn read_blocks(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let count = block_count(buf.len())?;
        let mut session = Session::open(&mut self.bus, self.config)?;

        let cmd = if count == 1 {
            CMD17_READ_SINGLE_BLOCK
        } else {
            CMD18_READ_MULTIPLE_BLOCK
        };
        let result = session.command(cmd, addr, &[R1_READY]).and_then(|_| {
            for block in buf.chunks_exact_mut(BLOCK_SIZE) {
                session.read_block(block)?;
            }
            Ok(())
        });

        if count > 1 {
            let stop = session
                .command(CMD12_STOP_TRANSMISSION, 0, &[R1_READY])
                .map(|_| ());
            return settle(result, stop);
        }
        result
    }

    /// Write `data` (a multiple of 512 bytes) starting at byte address `addr`
    ///
    /// Returns the number of blocks the card accepted.
    pub fn write_blocks(&mut self, addr: u32, data: &[u8]) -> Result<usize> {
        let count = block_count(data.len())?;
        let mut session = Session::open(&mut self.bus, self.config)?;

        let (cmd, token) = if count == 1 {
            (CMD24_WRITE_BLOCK, TOKEN_START_BLOCK)
        } else {
            (CMD25_WRITE_MULTIPLE_BLOCK, TOKEN_START_MULTI_WRITE)
        };
        let mut written = 0;
        let result = session.command(cmd, addr, &[R1_READY]).and_then(|_| {
            for block in data.chunks_exact(BLOCK_SIZE) {
                session.write_block(token, block)?;
                written += 1;
            }
            Ok(())
        });

        let result = if count > 1 {
            settle(result, session.stop_write())
        } else {
            result
        };
        result.map(|_| written)
    }
}

fn block_count(len: usize) -> Result<usize> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(Error::InvalidLength);
    }
    Ok(len / BLOCK_SIZE)
}

/// Combine a transaction result with its mandatory cleanup step
fn settle(result: Result<()>, cleanup: Result<()>) -> Result<()> {
    match (result, cleanup) {
        (Err(e), Err(cleanup_err)) => {
            log::warn!("Cleanup after failed transfer also failed: {}", cleanup_err);
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// One exclusive, chip-selected exchange with the card
struct Session<'a, B: SpiBus> {
    bus: BusGuard<'a, B>,
    config: SdSpiConfig,
}

impl<'a, B: SpiBus> Session<'a, B> {
    fn open(bus: &'a mut B, config: SdSpiConfig) -> Result<Self> {
        Ok(Self {
            bus: BusGuard::acquire(bus)?,
            config,
        })
    }

    fn idle(&mut self) -> Result<()> {
        let mut left = self.config.dummy_bytes;
        while left > 0 {
            let n = left.min(IDLE_FILL.len());
            self.bus.write(&IDLE_FILL[..n])?;
            left -= n;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.bus.read(&mut byte)?;
        Ok(byte[0])
    }

    /// Poll for the first non-idle byte
    fn poll(&mut self) -> Result<Option<u8>> {
        for _ in 0..self.config.timeout {
            let byte = self.read_byte()?;
            if byte != IDLE_BYTE {
                return Ok(Some(byte));
            }
        }
        Ok(None)
    }

    fn exchange(&mut self, frame: &CommandFrame, kind: ResponseKind) -> Result<Option<Response>> {
        self.idle()?;
        self.bus.write(frame.as_bytes())?;
        let Some(r1) = self.poll()? else {
            return Ok(None);
        };

        let mut bytes = [0u8; 5];
        bytes[0] = r1;
        let size = kind.size();
        if size > 1 {
            self.bus.read(&mut bytes[1..size])?;
        }
        if kind == ResponseKind::R1b {
            while self.read_byte()? == 0x00 {}
        }
        Ok(Some(Response { kind, bytes }))
    }

    fn command(&mut self, index: u8, arg: u32, accept: &[u8]) -> Result<Response> {
        let kind = ResponseKind::for_command(index).ok_or(Error::UnsupportedCommand(index))?;
        let frame = CommandFrame::new(index, arg);

        for _ in 0..self.config.timeout.max(1) {
            if let Some(response) = self.exchange(&frame, kind)? {
                if accept.is_empty() || accept.contains(&response.r1()) {
                    return Ok(response);
                }
                log::trace!("CMD{}: unexpected R1 0x{:02X}", index, response.r1());
            }
        }
        log::debug!("CMD{}: no acceptable response", index);
        Err(Error::ResponseTimeout { cmd: index })
    }

    fn app_command(&mut self, index: u8, arg: u32, accept: &[u8]) -> Result<Response> {
        let kind = ResponseKind::for_app_command(index).ok_or(Error::UnsupportedCommand(index))?;
        let frame = CommandFrame::new(index, arg);

        for _ in 0..self.config.timeout.max(1) {
            self.command(CMD55_APP_CMD, 0, &[R1_READY, R1_IDLE_STATE])?;
            if let Some(response) = self.exchange(&frame, kind)? {
                if accept.is_empty() || accept.contains(&response.r1()) {
                    return Ok(response);
                }
                log::trace!("ACMD{}: unexpected R1 0x{:02X}", index, response.r1());
            }
        }
        log::debug!("ACMD{}: no acceptable response", index);
        Err(Error::ResponseTimeout { cmd: index })
    }

    fn read_block(&mut self, block: &mut [u8]) -> Result<()> {
        match self.poll()? {
            Some(TOKEN_START_BLOCK) => {}
            Some(other) => {
                log::debug!("Expected start token, got 0x{:02X}", other);
                return Err(Error::StartTokenTimeout);
            }
            None => return Err(Error::StartTokenTimeout),
        }

        self.bus.read(block)?;
        let mut trailer = [0u8; 2];
        self.bus.read(&mut trailer)?;

        let received = u16::from_be_bytes(trailer);
        let computed = crc16(block);
        if received != computed {
            return Err(Error::BlockCrcMismatch { received, computed });
        }
        Ok(())
    }

    fn write_block(&mut self, token: u8, block: &[u8]) -> Result<()> {
        self.idle()?;
        self.bus.write(&[token])?;
        self.bus.write(block)?;
        self.bus.write(&crc16(block).to_be_bytes())?;

        match self.read_byte()? & DATA_RESPONSE_MASK {
            DATA_ACCEPTED => {}
            DATA_CRC_ERROR => return Err(Error::WriteRejected(WriteRejection::Crc)),
            DATA_WRITE_ERROR => return Err(Error::WriteRejected(WriteRejection::Write)),
            other => return Err(Error::WriteRejected(WriteRejection::Unknown(other))),
        }
        self.wait_busy()
    }

    fn stop_write(&mut self) -> Result<()> {
        self.bus.write(&[TOKEN_STOP_TRAN])?;
        self.wait_busy()
    }

    /// Wait for the card to signal busy and then release the bus
    fn wait_busy(&mut self) -> Result<()> {
        let mut seen_busy = false;
        loop {
            let byte = self.read_byte()?;
            if byte == 0x00 {
                seen_busy = true;
            } else if seen_busy {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bus that replays a fixed script of card bytes, then idles
    struct Script {
        bytes: [u8; 600],
        len: usize,
        pos: usize,
        locked: bool,
        selected: bool,
        frames_sent: usize,
    }

    impl Script {
        fn new(script: &[u8]) -> Self {
            let mut bytes = [IDLE_BYTE; 600];
            bytes[..script.len()].copy_from_slice(script);
            Self {
                bytes,
                len: script.len(),
                pos: 0,
                locked: false,
                selected: false,
                frames_sent: 0,
            }
        }
    }

    impl SpiBus for Script {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            if data.len() == 6 && data[0] & 0xC0 == 0x40 {
                self.frames_sent += 1;
            }
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            for b in buf.iter_mut() {
                *b = if self.pos < self.len {
                    self.pos += 1;
                    self.bytes[self.pos - 1]
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
            Ok(())
        }
        fn lock(&mut self) -> Result<()> {
            self.locked = true;
            Ok(())
        }
        fn unlock(&mut self) -> Result<()> {
            self.locked = false;
            Ok(())
        }
        fn delay_us(&mut self, _us: u32) {}
    }

    fn config() -> SdSpiConfig {
        SdSpiConfig {
            timeout: 4,
            dummy_bytes: 1,
        }
    }

    #[test]
    fn read_block_with_bad_crc_fails() {
        let mut script = [0u8; 516];
        script[0] = R1_READY;
        script[1] = TOKEN_START_BLOCK;
        script[2..514].fill(0xA5);
        let crc = crc16(&[0xA5; 512]) ^ 0x0001;
        script[514..516].copy_from_slice(&crc.to_be_bytes());

        let mut sd = SdSpi::with_config(Script::new(&script), config());
        let mut buf = [0u8; 512];
        assert!(matches!(
            sd.read_blocks(0, &mut buf),
            Err(Error::BlockCrcMismatch { .. })
        ));
        assert!(!sd.bus_mut().locked);
        assert!(!sd.bus_mut().selected);
    }

    #[test]
    fn read_single_block() {
        let data: [u8; 512] = core::array::from_fn(|i| i as u8);
        let mut script = [0u8; 516];
        script[0] = R1_READY;
        script[1] = TOKEN_START_BLOCK;
        script[2..514].copy_from_slice(&data);
        script[514..516].copy_from_slice(&crc16(&data).to_be_bytes());

        let mut sd = SdSpi::with_config(Script::new(&script), config());
        let mut buf = [0u8; 512];
        sd.read_blocks(0x200, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn write_rejections_are_classified() {
        for (token, reason) in [
            (0xEB, WriteRejection::Crc),
            (0xED, WriteRejection::Write),
            (0xE7, WriteRejection::Unknown(0x07)),
        ] {
            let mut sd = SdSpi::with_config(Script::new(&[R1_READY, token]), config());
            assert_eq!(
                sd.write_blocks(0, &[0u8; 512]),
                Err(Error::WriteRejected(reason))
            );
            assert!(!sd.bus_mut().selected);
        }
    }

    #[test]
    fn write_waits_for_busy_release() {
        let mut sd = SdSpi::with_config(
            Script::new(&[R1_READY, 0xE5, 0x00, 0x00, 0x00]),
            config(),
        );
        assert_eq!(sd.write_blocks(0, &[0x5A; 512]), Ok(1));
    }

    #[test]
    fn unanswered_command_times_out() {
        let mut sd = SdSpi::with_config(Script::new(&[]), config());
        assert_eq!(
            sd.send_cmd(CMD0_GO_IDLE_STATE, 0, &[R1_IDLE_STATE]),
            Err(Error::ResponseTimeout { cmd: 0 })
        );
        assert_eq!(sd.bus_mut().frames_sent, 4);
    }

    #[test]
    fn rejected_response_is_retried() {
        let mut sd = SdSpi::with_config(Script::new(&[0x05, R1_IDLE_STATE]), config());
        let response = sd.send_cmd(CMD0_GO_IDLE_STATE, 0, &[R1_IDLE_STATE]).unwrap();
        assert_eq!(response.r1(), R1_IDLE_STATE);
        assert_eq!(sd.bus_mut().frames_sent, 2);
    }

    #[test]
    fn r7_carries_payload() {
        let mut sd = SdSpi::with_config(Script::new(&[0x01, 0x00, 0x00, 0x01, 0xAA]), config());
        let response = sd.send_cmd(8, 0x1AA, &[]).unwrap();
        assert_eq!(response.trailer(), &[0x00, 0x00, 0x01, 0xAA]);
    }

    #[test]
    fn unsupported_command_is_refused() {
        let mut sd = SdSpi::with_config(Script::new(&[]), config());
        assert_eq!(
            sd.send_cmd(2, 0, &[]),
            Err(Error::UnsupportedCommand(2))
        );
    }

    #[test]
    fn partial_block_is_invalid() {
        let mut sd = SdSpi::with_config(Script::new(&[]), config());
        assert_eq!(sd.write_blocks(0, &[0u8; 100]), Err(Error::InvalidLength));
        let mut empty = [0u8; 0];
        assert_eq!(sd.read_blocks(0, &mut empty), Err(Error::InvalidLength));
    }
}

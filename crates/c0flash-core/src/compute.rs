//! Compute-core command protocol
//!
//! The host talks to a running core through a handful of memory-mapped
//! registers: it writes a command word, polls a status word until the core
//! reports [`SocStatus::Done`], fetches the result buffer and finally drives
//! the core back to [`SocStatus::WaitForCommand`] with an idle command.
//! The register layout comes from a [`ComputeMap`].

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::adapter::DeviceIo;
use crate::bitstream::{self, BitstreamReport};
use crate::error::{Error, Result};
use crate::flash::{self, FlashProgress};
use crate::memory_map::{
    ComputeMap, Field, PLUS_APPLICATION_OFFSET, PLUS_BITSTREAM_OFFSET,
};
use crate::status::{self, DeviceStatus, Mode};

/// Default status poll interval while the core is calculating
pub const DEFAULT_POLL_INTERVAL_US: u32 = 500_000;

/// Status word values reported by the compute core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SocStatus {
    /// Idle, ready for a command
    WaitForCommand = 0,
    /// Busy with the last command
    Calculating = 1,
    /// Finished; results are in the result buffer
    Done = 2,
    /// The last command was not recognized
    InvalidCommand = 3,
}

impl SocStatus {
    /// Decode a raw status word
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::WaitForCommand),
            1 => Some(Self::Calculating),
            2 => Some(Self::Done),
            3 => Some(Self::InvalidCommand),
            _ => None,
        }
    }
}

impl core::fmt::Display for SocStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::WaitForCommand => write!(f, "waiting for command"),
            Self::Calculating => write!(f, "calculating"),
            Self::Done => write!(f, "done"),
            Self::InvalidCommand => write!(f, "invalid command"),
        }
    }
}

bitflags! {
    /// Bits of the packed configuration register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConfigBits: u32 {
        /// Core reset, active low
        const RESET_N = 1 << 0;
        /// Bitstream region writable
        const UNLOCK_BITSTREAM = 1 << 1;
        /// LED driven by the register instead of the core
        const LED_ENABLE = 1 << 2;
        /// LED state
        const LED = 1 << 3;
    }
}

/// Unpacked configuration register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigRegister {
    /// Core out of reset
    pub reset_n: bool,
    /// Bitstream region writable
    pub unlock_bitstream: bool,
    /// LED driven by the register
    pub led_enable: bool,
    /// LED state
    pub led: bool,
}

impl ConfigRegister {
    /// Pack into the register word
    pub fn pack(self) -> u32 {
        let mut bits = ConfigBits::empty();
        bits.set(ConfigBits::RESET_N, self.reset_n);
        bits.set(ConfigBits::UNLOCK_BITSTREAM, self.unlock_bitstream);
        bits.set(ConfigBits::LED_ENABLE, self.led_enable);
        bits.set(ConfigBits::LED, self.led);
        bits.bits()
    }

    /// Unpack a register word, ignoring undefined bits
    pub fn unpack(raw: u32) -> Self {
        let bits = ConfigBits::from_bits_truncate(raw);
        Self {
            reset_n: bits.contains(ConfigBits::RESET_N),
            unlock_bitstream: bits.contains(ConfigBits::UNLOCK_BITSTREAM),
            led_enable: bits.contains(ConfigBits::LED_ENABLE),
            led: bits.contains(ConfigBits::LED),
        }
    }
}

/// Options for [`ComputeController::calculate_command_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalculateOptions {
    /// Delay between status polls while calculating
    pub poll_interval_us: u32,
    /// Leave the result buffer unread
    pub skip_result_read: bool,
    /// Bytes to fetch from the result buffer; `None` reads all of it
    pub result_len: Option<usize>,
}

impl Default for CalculateOptions {
    fn default() -> Self {
        Self {
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            skip_result_read: false,
            result_len: None,
        }
    }
}

fn check_fits(region: Field, len: usize) -> Result<()> {
    if len > region.len {
        return Err(Error::BufferTooLarge {
            len,
            max: region.len,
        });
    }
    Ok(())
}

/// Host side of the compute-core protocol
pub struct ComputeController<D: DeviceIo> {
    device: D,
    map: &'static ComputeMap,
    force: bool,
}

impl<D: DeviceIo> ComputeController<D> {
    /// Build a controller for `map`
    ///
    /// Maps that sit behind the C0-microSD bootloader need the card to be
    /// running the SoC configuration; that is checked here unless `force`
    /// is set.
    pub fn new(device: D, map: &'static ComputeMap, force: bool) -> Result<Self> {
        let mut controller = Self { device, map, force };
        if map.requires_soc_mode {
            controller.check_soc_mode()?;
        }
        Ok(controller)
    }

    fn check_soc_mode(&mut self) -> Result<DeviceStatus> {
        let status = status::read_status(&mut self.device)?;
        if status.mode != Mode::Soc {
            if !self.force {
                return Err(Error::WrongMode {
                    required: Mode::Soc,
                });
            }
            log::warn!("Device is not in Signaloid Core mode, continuing anyway");
        }
        Ok(status)
    }

    /// Register map in use
    pub fn map(&self) -> &'static ComputeMap {
        self.map
    }

    /// Access the device
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Release the device
    pub fn into_inner(self) -> D {
        self.device
    }

    /// Write the command register
    pub fn send_command(&mut self, command: u32) -> Result<()> {
        log::debug!("Sending command 0x{:08X}", command);
        self.device.write_u32(self.map.command_offset, command)
    }

    /// Read the raw status register
    pub fn read_status(&mut self) -> Result<u32> {
        self.device.read_u32(self.map.status_offset)
    }

    /// Read and decode the status register
    pub fn status(&mut self) -> Result<SocStatus> {
        let raw = self.read_status()?;
        SocStatus::from_raw(raw).ok_or(Error::UnknownComputeStatus(raw))
    }

    /// Copy `data` to the start of the input buffer
    pub fn write_input_buffer(&mut self, data: &[u8]) -> Result<()> {
        check_fits(self.map.input_buffer, data.len())?;
        self.device.write(self.map.input_buffer.offset, data)?;
        Ok(())
    }

    /// Read `len` bytes from the start of the result buffer
    pub fn read_result_buffer(&mut self, len: usize) -> Result<Vec<u8>> {
        check_fits(self.map.result_buffer, len)?;
        self.device.read_exact(self.map.result_buffer.offset, len)
    }

    /// Read the SoC control register
    pub fn control_register(&mut self) -> Result<u32> {
        let offset = self
            .map
            .control_offset
            .ok_or(Error::UnsupportedOperation)?;
        self.device.read_u32(offset)
    }

    fn config_offset(&self) -> Result<u64> {
        self.map.config_offset.ok_or(Error::UnsupportedOperation)
    }

    /// Read the raw configuration register
    pub fn read_config_register(&mut self) -> Result<u32> {
        let offset = self.config_offset()?;
        self.device.read_u32(offset)
    }

    /// Write the raw configuration register
    pub fn write_config_register(&mut self, value: u32) -> Result<()> {
        let offset = self.config_offset()?;
        log::debug!("Configuration register <- 0x{:08X}", value);
        self.device.write_u32(offset, value)
    }

    /// Read and unpack the configuration register
    pub fn config(&mut self) -> Result<ConfigRegister> {
        self.read_config_register().map(ConfigRegister::unpack)
    }

    /// Pack and write the configuration register
    pub fn set_config(&mut self, config: ConfigRegister) -> Result<()> {
        self.write_config_register(config.pack())
    }

    fn update_config(&mut self, set: ConfigBits, clear: ConfigBits) -> Result<()> {
        let value = self.read_config_register()?;
        self.write_config_register((value | set.bits()) & !clear.bits())
    }

    /// Read the core boot address
    pub fn boot_address(&mut self) -> Result<u32> {
        let offset = self
            .map
            .boot_address_offset
            .ok_or(Error::UnsupportedOperation)?;
        self.device.read_u32(offset)
    }

    /// Set the core boot address
    pub fn set_boot_address(&mut self, address: u32) -> Result<()> {
        let offset = self
            .map
            .boot_address_offset
            .ok_or(Error::UnsupportedOperation)?;
        log::debug!("Boot address <- 0x{:08X}", address);
        self.device.write_u32(offset, address)
    }

    /// Make the bitstream region writable
    pub fn unlock_bitstream(&mut self) -> Result<()> {
        log::info!("Unlocking bitstream region");
        self.update_config(ConfigBits::UNLOCK_BITSTREAM, ConfigBits::empty())
    }

    /// Write-protect the bitstream region
    pub fn lock_bitstream(&mut self) -> Result<()> {
        log::info!("Locking bitstream region");
        self.update_config(ConfigBits::empty(), ConfigBits::UNLOCK_BITSTREAM)
    }

    /// Release the core from reset
    pub fn start_core(&mut self) -> Result<()> {
        self.send_command(0)?;
        self.write_config_register(ConfigBits::RESET_N.bits())
    }

    /// Hold the core in reset
    pub fn stop_core(&mut self) -> Result<()> {
        self.write_config_register(0)?;
        self.send_command(0)
    }

    /// Flash and verify the FPGA bitstream
    ///
    /// The bitstream region is unlocked for the write and locked again on
    /// every way out.
    pub fn flash_bitstream<P: FlashProgress + ?Sized>(
        &mut self,
        data: &[u8],
        max_attempts: u32,
        progress: &mut P,
    ) -> Result<bool> {
        self.unlock_bitstream()?;
        let outcome = flash::write_and_verify(
            &mut self.device,
            data,
            PLUS_BITSTREAM_OFFSET,
            max_attempts,
            progress,
        );
        match (outcome, self.lock_bitstream()) {
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            (Ok(verified), Ok(())) => Ok(verified),
        }
    }

    /// Flash and verify the core application binary
    pub fn flash_application<P: FlashProgress + ?Sized>(
        &mut self,
        data: &[u8],
        max_attempts: u32,
        progress: &mut P,
    ) -> Result<bool> {
        self.config_offset()?;
        flash::write_and_verify(
            &mut self.device,
            data,
            PLUS_APPLICATION_OFFSET,
            max_attempts,
            progress,
        )
    }

    /// Check the stored bitstream against its own metadata
    pub fn verify_bitstream(&mut self) -> Result<BitstreamReport> {
        self.config_offset()?;
        bitstream::inspect(&mut self.device, PLUS_BITSTREAM_OFFSET)
    }

    /// Run `command` to completion and return the whole result buffer
    pub fn calculate_command(&mut self, command: u32, idle_command: u32) -> Result<Vec<u8>> {
        let result =
            self.calculate_command_with(command, idle_command, &CalculateOptions::default())?;
        Ok(result.unwrap_or_default())
    }

    /// Run `command` to completion
    ///
    /// Returns `None` when `options.skip_result_read` is set. Whatever the
    /// outcome, the core is driven back to [`SocStatus::WaitForCommand`]
    /// with `idle_command` before returning.
    pub fn calculate_command_with(
        &mut self,
        command: u32,
        idle_command: u32,
        options: &CalculateOptions,
    ) -> Result<Option<Vec<u8>>> {
        self.send_command(command)?;
        let outcome = self.wait_for_result(options);
        let idle = self.return_to_idle(idle_command);
        match (outcome, idle) {
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            (Ok(result), Ok(())) => Ok(result),
        }
    }

    fn wait_for_result(&mut self, options: &CalculateOptions) -> Result<Option<Vec<u8>>> {
        loop {
            let raw = self.read_status()?;
            match SocStatus::from_raw(raw) {
                Some(SocStatus::Calculating) => {
                    log::trace!("Core calculating");
                    self.device.delay_us(options.poll_interval_us);
                }
                Some(SocStatus::Done) => {
                    log::debug!("Core done");
                    if options.skip_result_read {
                        return Ok(None);
                    }
                    let len = options.result_len.unwrap_or(self.map.result_buffer.len);
                    return self.read_result_buffer(len).map(Some);
                }
                Some(SocStatus::WaitForCommand) => log::trace!("Core has not picked up the command"),
                Some(SocStatus::InvalidCommand) => return Err(Error::InvalidCommand),
                None => return Err(Error::UnknownComputeStatus(raw)),
            }
        }
    }

    fn return_to_idle(&mut self, idle_command: u32) -> Result<()> {
        loop {
            self.send_command(idle_command)?;
            if self.read_status()? == SocStatus::WaitForCommand as u32 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::NoProgress;
    use crate::memory_map::{C0_MICROSD_PLUS, C0_MICROSD_SOC};
    use crate::status::STATUS_OFFSET;
    use alloc::collections::BTreeMap;
    use alloc::vec;

    const IDLE: u32 = 0;
    const SQUARE: u32 = 0x10;

    /// Core that squares the first input word after a few polls
    struct FakeCore {
        map: &'static ComputeMap,
        memory: BTreeMap<u64, u8>,
        busy_polls: u32,
        remaining: u32,
        stuck_status: Option<u32>,
        commands: Vec<u32>,
        delays: u32,
    }

    impl FakeCore {
        fn new(map: &'static ComputeMap) -> Self {
            Self {
                map,
                memory: BTreeMap::new(),
                busy_polls: 2,
                remaining: 0,
                stuck_status: None,
                commands: Vec::new(),
                delays: 0,
            }
        }

        fn with_mode(map: &'static ComputeMap, id: &[u8; 4]) -> Self {
            let mut core = Self::new(map);
            core.poke(STATUS_OFFSET, id);
            core
        }

        fn poke(&mut self, offset: u64, data: &[u8]) {
            for (i, &b) in data.iter().enumerate() {
                self.memory.insert(offset + i as u64, b);
            }
        }

        fn peek_u32(&self, offset: u64) -> u32 {
            let mut raw = [0u8; 4];
            for (i, b) in raw.iter_mut().enumerate() {
                *b = self.memory.get(&(offset + i as u64)).copied().unwrap_or(0);
            }
            u32::from_le_bytes(raw)
        }

        fn set_status(&mut self, status: SocStatus) {
            let offset = self.map.status_offset;
            self.poke(offset, &(status as u32).to_le_bytes());
        }

        fn on_command(&mut self, command: u32) {
            self.commands.push(command);
            match command {
                IDLE => self.set_status(SocStatus::WaitForCommand),
                SQUARE => {
                    let x = self.peek_u32(self.map.input_buffer.offset);
                    let offset = self.map.result_buffer.offset;
                    self.poke(offset, &(x * x).to_le_bytes());
                    self.remaining = self.busy_polls;
                    self.set_status(SocStatus::Calculating);
                }
                _ => self.set_status(SocStatus::InvalidCommand),
            }
        }
    }

    impl DeviceIo for FakeCore {
        fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
            if offset == self.map.status_offset {
                if let Some(raw) = self.stuck_status {
                    return Ok(raw.to_le_bytes()[..len.min(4)].to_vec());
                }
                if self.peek_u32(offset) == SocStatus::Calculating as u32 {
                    if self.remaining == 0 {
                        self.set_status(SocStatus::Done);
                    } else {
                        self.remaining -= 1;
                    }
                }
            }
            Ok((0..len as u64)
                .map(|i| self.memory.get(&(offset + i)).copied().unwrap_or(0))
                .collect())
        }

        fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
            self.poke(offset, data);
            if offset == self.map.command_offset && data.len() == 4 {
                self.on_command(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
            }
            Ok(data.len())
        }

        fn delay_us(&mut self, _us: u32) {
            self.delays += 1;
        }
    }

    #[test]
    fn config_register_pack_unpack() {
        for raw in 0u32..16 {
            let config = ConfigRegister::unpack(raw);
            assert_eq!(config.pack(), raw);
        }
        let config = ConfigRegister {
            reset_n: true,
            led: true,
            ..Default::default()
        };
        assert_eq!(config.pack(), 0b1001);
        assert_eq!(ConfigRegister::unpack(0xFFFF_FFF0), ConfigRegister::default());
    }

    #[test]
    fn soc_status_from_raw() {
        assert_eq!(SocStatus::from_raw(2), Some(SocStatus::Done));
        assert_eq!(SocStatus::from_raw(4), None);
    }

    #[test]
    fn calculate_returns_result() {
        let core = FakeCore::with_mode(&C0_MICROSD_SOC, b"SSOC");
        let mut c = ComputeController::new(core, &C0_MICROSD_SOC, false).unwrap();
        c.write_input_buffer(&7u32.to_le_bytes()).unwrap();
        let options = CalculateOptions {
            result_len: Some(4),
            ..Default::default()
        };
        let result = c.calculate_command_with(SQUARE, IDLE, &options).unwrap();
        assert_eq!(result, Some(49u32.to_le_bytes().to_vec()));
        assert_eq!(c.status().unwrap(), SocStatus::WaitForCommand);

        let core = c.into_inner();
        assert_eq!(core.delays, 2);
        assert_eq!(core.commands, vec![SQUARE, IDLE]);
    }

    #[test]
    fn calculate_reads_whole_result_buffer() {
        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        c.write_input_buffer(&3u32.to_le_bytes()).unwrap();
        let result = c.calculate_command(SQUARE, IDLE).unwrap();
        assert_eq!(result.len(), C0_MICROSD_PLUS.result_buffer.len);
        assert_eq!(result[..4], 9u32.to_le_bytes());
    }

    #[test]
    fn skip_result_read() {
        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        let options = CalculateOptions {
            skip_result_read: true,
            ..Default::default()
        };
        assert_eq!(c.calculate_command_with(SQUARE, IDLE, &options), Ok(None));
    }

    #[test]
    fn invalid_command_still_returns_to_idle() {
        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        assert_eq!(c.calculate_command(0xDEAD, IDLE), Err(Error::InvalidCommand));
        assert_eq!(c.status().unwrap(), SocStatus::WaitForCommand);
        assert_eq!(c.into_inner().commands, vec![0xDEAD, IDLE]);
    }

    #[test]
    fn unknown_status() {
        let mut core = FakeCore::new(&C0_MICROSD_PLUS);
        core.stuck_status = Some(7);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        let options = CalculateOptions {
            skip_result_read: true,
            ..Default::default()
        };
        // Ends up stuck trying to idle, so probe the poll loop directly
        c.send_command(SQUARE).unwrap();
        assert_eq!(c.wait_for_result(&options), Err(Error::UnknownComputeStatus(7)));
        assert_eq!(c.status(), Err(Error::UnknownComputeStatus(7)));
    }

    #[test]
    fn buffer_bounds() {
        let core = FakeCore::with_mode(&C0_MICROSD_SOC, b"SSOC");
        let mut c = ComputeController::new(core, &C0_MICROSD_SOC, false).unwrap();
        assert_eq!(
            c.write_input_buffer(&[0u8; 4097]),
            Err(Error::BufferTooLarge {
                len: 4097,
                max: 4096
            })
        );
        assert!(c.read_result_buffer(4097).is_err());
        assert_eq!(c.read_result_buffer(16).unwrap().len(), 16);
    }

    #[test]
    fn soc_map_requires_soc_mode() {
        let core = FakeCore::with_mode(&C0_MICROSD_SOC, b"SBLD");
        assert!(matches!(
            ComputeController::new(core, &C0_MICROSD_SOC, false),
            Err(Error::WrongMode {
                required: Mode::Soc
            })
        ));

        let core = FakeCore::with_mode(&C0_MICROSD_SOC, b"SBLD");
        assert!(ComputeController::new(core, &C0_MICROSD_SOC, true).is_ok());
    }

    #[test]
    fn register_access_depends_on_map() {
        let core = FakeCore::with_mode(&C0_MICROSD_SOC, b"SSOC");
        let mut c = ComputeController::new(core, &C0_MICROSD_SOC, false).unwrap();
        assert_eq!(c.control_register(), Ok(0));
        assert_eq!(c.config(), Err(Error::UnsupportedOperation));
        assert_eq!(c.set_boot_address(0), Err(Error::UnsupportedOperation));
        assert_eq!(
            c.flash_bitstream(&[0u8; 4], 1, &mut NoProgress),
            Err(Error::UnsupportedOperation)
        );

        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        assert_eq!(c.control_register(), Err(Error::UnsupportedOperation));
        c.set_boot_address(0x0018_0000).unwrap();
        assert_eq!(c.boot_address(), Ok(0x0018_0000));
    }

    #[test]
    fn unlock_preserves_other_bits() {
        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        c.write_config_register(0b1101).unwrap();
        c.unlock_bitstream().unwrap();
        assert_eq!(c.read_config_register(), Ok(0b1111));
        c.lock_bitstream().unwrap();
        assert_eq!(c.read_config_register(), Ok(0b1101));
    }

    #[test]
    fn core_start_and_stop() {
        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        c.start_core().unwrap();
        assert!(c.config().unwrap().reset_n);
        c.stop_core().unwrap();
        assert_eq!(c.config(), Ok(ConfigRegister::default()));
        assert_eq!(c.into_inner().commands, vec![0, 0]);
    }

    #[test]
    fn flash_bitstream_relocks() {
        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        c.write_config_register(ConfigBits::RESET_N.bits()).unwrap();
        let image = vec![0x5Au8; 64];
        assert_eq!(c.flash_bitstream(&image, 3, &mut NoProgress), Ok(true));
        assert_eq!(c.read_config_register(), Ok(ConfigBits::RESET_N.bits()));
        assert_eq!(c.device_mut().read(PLUS_BITSTREAM_OFFSET, 64).unwrap(), image);
    }

    #[test]
    fn flash_application() {
        let core = FakeCore::new(&C0_MICROSD_PLUS);
        let mut c = ComputeController::new(core, &C0_MICROSD_PLUS, false).unwrap();
        assert_eq!(c.flash_application(&[1, 2, 3], 1, &mut NoProgress), Ok(true));
        assert_eq!(
            c.device_mut().read(PLUS_APPLICATION_OFFSET, 3).unwrap(),
            vec![1, 2, 3]
        );
    }
}

//! In-memory C0-microSD
//!
//! Models what the host sees through the card's block interface: the
//! status record, the lock and switch control words of the bootloader,
//! write protection of the protected sections and the compute core's
//! registers. Unwritten memory reads as `0xFF`.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use c0flash_core::adapter::DeviceIo;
use c0flash_core::compute::{ConfigBits, SocStatus};
use c0flash_core::error::Result;
use c0flash_core::memory_map::{
    self, BootloaderMap, ComputeMap, C0_MICROSD_PLUS, C0_MICROSD_SOC, PLUS_BOOTLOADER_OFFSET,
    WARMBOOT_LEN,
};
use c0flash_core::status::{
    Mode, Version, BOOTLOADER_ID, SOC_ID, STATE_SWITCHING, STATUS_LEN, STATUS_OFFSET,
};

const PAGE_SIZE: usize = 4096;

/// Command that returns the emulated core to idle
pub const IDLE_COMMAND: u32 = 0;
/// Command the emulated core answers with the bitwise NOT of its input buffer
pub const INVERT_COMMAND: u32 = 1;

/// Which card is emulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    /// Bootloader-managed C0-microSD
    C0MicroSd,
    /// C0-microSD+ with its configuration register
    C0MicroSdPlus,
}

/// Configuration for the dummy card
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Card model
    pub personality: Personality,
    /// Configuration loaded at power-up (C0-microSD only)
    pub mode: Mode,
    /// Reported configuration version; its major selects the memory map
    pub version: Version,
    /// Serial number programmed at the factory
    pub serial_number: String,
    /// UUID programmed at the factory
    pub uuid: String,
    /// Status polls a command stays in the calculating state
    pub compute_polls: u32,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            personality: Personality::C0MicroSd,
            mode: Mode::Bootloader,
            version: Version { major: 2, minor: 0 },
            serial_number: String::from("C0DUMMY0000001"),
            uuid: String::from("5c0a9d0e-0000-4000-8000-000000000001"),
            compute_polls: 2,
        }
    }
}

/// Emulated C0-microSD
pub struct DummyCard {
    config: DummyConfig,
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
    mode: Mode,
    unlocked: bool,
    switch_pending: bool,
    soc_status: SocStatus,
    busy_polls: u32,
    config_register: u32,
    boot_address: u32,
}

fn overlay(data: &mut [u8], base: u64, at: u64, bytes: &[u8]) {
    if at < base {
        return;
    }
    let start = (at - base) as usize;
    if let Some(window) = data.get_mut(start..start + bytes.len()) {
        window.copy_from_slice(bytes);
    }
}

impl DummyCard {
    /// Create a card with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        let mut card = Self {
            mode: config.mode,
            config,
            pages: BTreeMap::new(),
            unlocked: false,
            switch_pending: false,
            soc_status: SocStatus::WaitForCommand,
            busy_polls: 0,
            config_register: 0,
            boot_address: 0,
        };
        if card.config.personality == Personality::C0MicroSd {
            let map = card.map();
            let serial = card.config.serial_number.clone();
            let uuid = card.config.uuid.clone();
            card.poke(map.serial_number.offset, serial.as_bytes());
            card.poke(map.uuid.offset, uuid.as_bytes());
        }
        card
    }

    /// Create a bootloader-mode C0-microSD with bootloader version 2
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Create a C0-microSD+
    pub fn new_plus() -> Self {
        Self::new(DummyConfig {
            personality: Personality::C0MicroSdPlus,
            mode: Mode::Soc,
            ..Default::default()
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Currently loaded configuration
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether the protected sections accept writes
    pub fn is_unlocked(&self) -> bool {
        match self.config.personality {
            Personality::C0MicroSd => self.unlocked,
            Personality::C0MicroSdPlus => {
                self.config_register & ConfigBits::UNLOCK_BITSTREAM.bits() != 0
            }
        }
    }

    /// Whether a boot configuration switch waits for a power cycle
    pub fn switch_pending(&self) -> bool {
        self.switch_pending
    }

    /// Current compute core status
    pub fn soc_status(&self) -> SocStatus {
        self.soc_status
    }

    /// Raw configuration register (C0-microSD+)
    pub fn config_register(&self) -> u32 {
        self.config_register
    }

    /// Remove and reapply power
    ///
    /// Applies a pending configuration switch and resets volatile state.
    pub fn power_cycle(&mut self) {
        if self.switch_pending {
            self.mode = match self.mode {
                Mode::Bootloader => Mode::Soc,
                _ => Mode::Bootloader,
            };
            log::debug!("dummy: Booted into {}", self.mode);
        }
        self.switch_pending = false;
        self.unlocked = false;
        self.soc_status = SocStatus::WaitForCommand;
        self.busy_polls = 0;
        self.config_register = 0;
    }

    /// Read memory without register side effects
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        (offset..offset + len as u64).map(|addr| self.load(addr)).collect()
    }

    /// Write memory, bypassing write protection
    pub fn poke(&mut self, offset: u64, data: &[u8]) {
        for (addr, &byte) in (offset..).zip(data) {
            self.store(addr, byte);
        }
    }

    fn load(&self, addr: u64) -> u8 {
        self.pages
            .get(&(addr / PAGE_SIZE as u64))
            .map_or(0xFF, |page| page[(addr % PAGE_SIZE as u64) as usize])
    }

    fn store(&mut self, addr: u64, byte: u8) {
        let page = self
            .pages
            .entry(addr / PAGE_SIZE as u64)
            .or_insert_with(|| Box::new([0xFF; PAGE_SIZE]));
        page[(addr % PAGE_SIZE as u64) as usize] = byte;
    }

    fn map(&self) -> &'static BootloaderMap {
        memory_map::bootloader_map(self.config.version.major)
    }

    fn compute_map(&self) -> Option<&'static ComputeMap> {
        match (self.config.personality, self.mode) {
            (Personality::C0MicroSdPlus, _) => Some(&C0_MICROSD_PLUS),
            (Personality::C0MicroSd, Mode::Soc) => Some(&C0_MICROSD_SOC),
            _ => None,
        }
    }

    fn status_record(&self) -> Option<[u8; STATUS_LEN]> {
        if self.config.personality != Personality::C0MicroSd {
            return None;
        }
        let id = match self.mode {
            Mode::Bootloader => BOOTLOADER_ID,
            Mode::Soc => SOC_ID,
            Mode::Unknown => *b"????",
        };
        let state = if self.switch_pending {
            STATE_SWITCHING
        } else {
            0
        };
        let mut record = [0u8; STATUS_LEN];
        record[..4].copy_from_slice(&id);
        record[4..6].copy_from_slice(&self.config.version.major.to_be_bytes());
        record[6..8].copy_from_slice(&self.config.version.minor.to_be_bytes());
        record[8..].copy_from_slice(&state.to_be_bytes());
        Some(record)
    }

    fn is_protected(&self, addr: u64) -> bool {
        if self.is_unlocked() {
            return false;
        }
        match self.config.personality {
            Personality::C0MicroSd => {
                let map = self.map();
                addr < WARMBOOT_LEN as u64
                    || (map.bootloader_offset..map.user_bitstream_offset).contains(&addr)
            }
            Personality::C0MicroSdPlus => addr < PLUS_BOOTLOADER_OFFSET,
        }
    }

    /// Advance the compute core by one status poll
    fn poll_core(&mut self) {
        if self.soc_status == SocStatus::Calculating {
            if self.busy_polls == 0 {
                self.soc_status = SocStatus::Done;
            } else {
                self.busy_polls -= 1;
            }
        }
    }

    fn on_command(&mut self, map: &ComputeMap, command: u32) {
        if self.config.personality == Personality::C0MicroSdPlus
            && self.config_register & ConfigBits::RESET_N.bits() == 0
        {
            log::debug!("dummy: Core held in reset, ignoring command 0x{:08X}", command);
            return;
        }
        self.soc_status = match command {
            IDLE_COMMAND => SocStatus::WaitForCommand,
            INVERT_COMMAND => {
                let input = self.peek(map.input_buffer.offset, map.input_buffer.len);
                let output: Vec<u8> = input.iter().map(|b| !b).collect();
                self.poke(map.result_buffer.offset, &output);
                self.busy_polls = self.config.compute_polls;
                SocStatus::Calculating
            }
            _ => SocStatus::InvalidCommand,
        };
    }

    /// Handle a write to a control word or register; returns false for plain memory
    fn write_control(&mut self, offset: u64, data: &[u8]) -> bool {
        if self.config.personality == Personality::C0MicroSd {
            let map = self.map();
            if offset == STATUS_OFFSET {
                return true;
            }
            if offset == map.switch_config_offset {
                log::debug!("dummy: Boot configuration switch requested");
                self.switch_pending = true;
                return true;
            }
            if self.mode == Mode::Bootloader && offset == map.unlock_offset {
                self.unlocked = data.starts_with(map.unlock_word);
                log::debug!(
                    "dummy: Bootloader {}",
                    if self.unlocked { "unlocked" } else { "locked" }
                );
                return true;
            }
        }

        let Some(map) = self.compute_map() else {
            return false;
        };
        if data.len() < 4 {
            return false;
        }
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if offset == map.command_offset {
            self.on_command(map, value);
        } else if Some(offset) == map.config_offset {
            self.config_register = value;
        } else if Some(offset) == map.boot_address_offset {
            self.boot_address = value;
        } else {
            return offset == map.status_offset || Some(offset) == map.control_offset;
        }
        true
    }
}

impl DeviceIo for DummyCard {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = self.peek(offset, len);
        if let Some(record) = self.status_record() {
            overlay(&mut data, offset, STATUS_OFFSET, &record);
        }
        if let Some(map) = self.compute_map() {
            if map.status_offset >= offset && map.status_offset + 4 <= offset + len as u64 {
                self.poll_core();
            }
            let status = self.soc_status as u32;
            overlay(&mut data, offset, map.status_offset, &status.to_le_bytes());
            if let Some(control) = map.control_offset {
                overlay(&mut data, offset, control, &0u32.to_le_bytes());
            }
            if let Some(config) = map.config_offset {
                overlay(&mut data, offset, config, &self.config_register.to_le_bytes());
            }
            if let Some(boot) = map.boot_address_offset {
                overlay(&mut data, offset, boot, &self.boot_address.to_le_bytes());
            }
        }
        Ok(data)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if self.write_control(offset, data) {
            return Ok(data.len());
        }

        let mut dropped = 0usize;
        for (addr, &byte) in (offset..).zip(data) {
            if self.is_protected(addr) {
                dropped += 1;
            } else {
                self.store(addr, byte);
            }
        }
        if dropped > 0 {
            log::warn!(
                "dummy: Dropped {} bytes written to protected memory at 0x{:08X}",
                dropped,
                offset
            );
        }
        Ok(data.len())
    }

    fn delay_us(&mut self, _us: u32) {
        // No delay needed for in-memory operations
    }
}

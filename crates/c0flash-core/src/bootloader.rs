//! Bootloader controller for C0-microSD
//!
//! A [`Controller`] owns its device for its whole lifetime and resolves
//! every named location through the [`BootloaderMap`] chosen when it was
//! built. Device state is never cached: [`Controller::get_status`] returns a
//! fresh [`DeviceStatus`] snapshot and every mutating operation fetches one
//! first.

use alloc::string::String;
use alloc::vec;

use crate::adapter::DeviceIo;
use crate::bitstream::{self, BitstreamPrefix, BitstreamReport, ImageKind};
use crate::error::{Error, Result};
use crate::flash::{self, FlashProgress, NoProgress};
use crate::memory_map::{self, BootloaderMap, LOCK_LEN, SWITCH_CONFIG_LEN, WARMBOOT_LEN};
use crate::status::{self, DeviceStatus, Mode};

/// Named region of the memory map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Bootloader bitstream (protected)
    Bootloader,
    /// Signaloid SoC bitstream (protected)
    Soc,
    /// User bitstream
    UserBitstream,
    /// User data
    UserData,
}

impl Section {
    /// Offset of the section in `map`
    pub fn offset(self, map: &BootloaderMap) -> u64 {
        match self {
            Self::Bootloader => map.bootloader_offset,
            Self::Soc => map.soc_offset,
            Self::UserBitstream => map.user_bitstream_offset,
            Self::UserData => map.user_data_offset,
        }
    }

    /// Whether writing the section needs the unlock word
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Bootloader | Self::Soc)
    }

    /// Image type that belongs in the section
    pub fn expected_kind(self) -> Option<ImageKind> {
        match self {
            Self::Bootloader => Some(ImageKind::Bootloader),
            Self::Soc => Some(ImageKind::Soc),
            Self::UserBitstream => Some(ImageKind::User),
            Self::UserData => None,
        }
    }
}

impl core::fmt::Display for Section {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bootloader => write!(f, "Bootloader bitstream"),
            Self::Soc => write!(f, "Signaloid Core bitstream"),
            Self::UserBitstream => write!(f, "user bitstream"),
            Self::UserData => write!(f, "user data"),
        }
    }
}

/// Render a fixed-size string field
///
/// Trailing `0xFF` padding is dropped and bytes outside the printable
/// ASCII range become `.`.
pub fn decode_ascii_field(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != 0xFF).map_or(0, |i| i + 1);
    raw[..end]
        .iter()
        .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
        .collect()
}

/// Bootloader-side controller
pub struct Controller<D: DeviceIo> {
    device: D,
    map: &'static BootloaderMap,
    force: bool,
}

impl<D: DeviceIo> Controller<D> {
    /// Build a controller for a known memory map
    ///
    /// With `force` set, an unrecognized or switching device is accepted
    /// and mode preconditions are skipped.
    pub fn new(device: D, map: &'static BootloaderMap, force: bool) -> Self {
        Self { device, map, force }
    }

    /// Read the device status and pick the matching memory map
    pub fn connect(device: D, force: bool) -> Result<Self> {
        let mut controller = Self::new(device, &memory_map::BOOTLOADER_V1, force);
        let status = controller.get_status()?;
        controller.map = memory_map::bootloader_map(status.version.major);
        log::debug!(
            "Using bootloader memory map v{} for {}",
            controller.map.version,
            status
        );
        Ok(controller)
    }

    /// Memory map in use
    pub fn map(&self) -> &'static BootloaderMap {
        self.map
    }

    /// Whether preconditions are overridden
    pub fn force(&self) -> bool {
        self.force
    }

    /// Access the device
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Release the device
    pub fn into_inner(self) -> D {
        self.device
    }

    /// Read and decode the status record without judging it
    pub fn read_status(&mut self) -> Result<DeviceStatus> {
        status::read_status(&mut self.device)
    }

    /// Fetch a fresh status snapshot
    ///
    /// Fails on an unrecognized configuration or a pending switch unless
    /// the controller was built with `force`.
    pub fn get_status(&mut self) -> Result<DeviceStatus> {
        let status = self.read_status()?;
        if status.mode == Mode::Unknown {
            if !self.force {
                return Err(Error::NotC0Device);
            }
            log::warn!("Unrecognized device configuration, continuing anyway");
        }
        if status.switching() {
            if !self.force {
                return Err(Error::ConfigurationSwitching);
            }
            log::warn!("Device reports a pending configuration switch, continuing anyway");
        }
        Ok(status)
    }

    /// Toggle the boot configuration between bootloader and SoC
    ///
    /// Takes effect after a power cycle. Returns the status seen before the
    /// switch.
    pub fn switch_boot_config(&mut self) -> Result<DeviceStatus> {
        let status = self.get_status()?;
        match status.mode {
            Mode::Bootloader => log::info!("Switching boot mode from Bootloader to Signaloid Core"),
            Mode::Soc => log::info!("Switching boot mode from Signaloid Core to Bootloader"),
            Mode::Unknown => log::info!("Switching boot mode"),
        }
        self.device
            .write(self.map.switch_config_offset, &[0u8; SWITCH_CONFIG_LEN])?;
        log::info!("Device configured; power cycle it to boot in the new mode");
        Ok(status)
    }

    /// Unlock the bootloader and SoC sections
    pub fn unlock_bootloader(&mut self) -> Result<()> {
        self.get_status()?;
        self.write_unlock()
    }

    /// Lock the bootloader and SoC sections
    pub fn lock_bootloader(&mut self) -> Result<()> {
        self.get_status()?;
        self.write_lock()
    }

    fn write_unlock(&mut self) -> Result<()> {
        log::info!("Unlocking bootloader");
        self.device.write(self.map.unlock_offset, self.map.unlock_word)?;
        Ok(())
    }

    fn write_lock(&mut self) -> Result<()> {
        log::info!("Locking bootloader");
        self.device.write(self.map.unlock_offset, &[0u8; LOCK_LEN])?;
        Ok(())
    }

    /// Write `data` at `offset` and verify it, retrying up to `max_attempts`
    ///
    /// Requires bootloader mode unless forced. With `unlock` the protected
    /// sections are unlocked first and locked again on every way out.
    /// Returns `Ok(false)` when no attempt verified.
    pub fn flash_and_verify(
        &mut self,
        data: &[u8],
        offset: u64,
        max_attempts: u32,
        unlock: bool,
    ) -> Result<bool> {
        self.flash_and_verify_with_progress(data, offset, max_attempts, unlock, &mut NoProgress)
    }

    /// [`Controller::flash_and_verify`] with progress reporting
    pub fn flash_and_verify_with_progress<P: FlashProgress + ?Sized>(
        &mut self,
        data: &[u8],
        offset: u64,
        max_attempts: u32,
        unlock: bool,
        progress: &mut P,
    ) -> Result<bool> {
        let status = self.get_status()?;
        if status.mode != Mode::Bootloader && !self.force {
            return Err(Error::WrongMode {
                required: Mode::Bootloader,
            });
        }

        if !unlock {
            return flash::write_and_verify(&mut self.device, data, offset, max_attempts, progress);
        }

        self.write_unlock()?;
        let outcome = flash::write_and_verify(&mut self.device, data, offset, max_attempts, progress);
        match (outcome, self.write_lock()) {
            (Ok(verified), Ok(())) => Ok(verified),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(lock_err)) => {
                log::error!("Failed to re-lock bootloader: {}", lock_err);
                Err(e)
            }
        }
    }

    /// Flash an image into a named section
    ///
    /// Protected sections are unlocked for the duration. An image whose
    /// metadata declares a type that does not belong in `section` is
    /// refused unless forced.
    pub fn flash_section<P: FlashProgress + ?Sized>(
        &mut self,
        section: Section,
        data: &[u8],
        max_attempts: u32,
        progress: &mut P,
    ) -> Result<bool> {
        if let (Some(expected), Some(declared)) = (section.expected_kind(), ImageKind::classify(data))
        {
            if declared != expected {
                if !self.force {
                    log::error!("Image declares type '{}', not '{}'", declared, expected);
                    return Err(Error::ImageTypeMismatch);
                }
                log::warn!("Image declares type '{}', flashing as '{}' anyway", declared, expected);
            }
        }
        let offset = section.offset(self.map);
        log::info!("Flashing {} at 0x{:08X}", section, offset);
        self.flash_and_verify_with_progress(data, offset, max_attempts, section.is_protected(), progress)
    }

    /// Parse the metadata prefix of the bitstream at `offset`
    pub fn get_bitstream_prefix(&mut self, offset: u64) -> Result<BitstreamPrefix> {
        bitstream::read_prefix(&mut self.device, offset)
    }

    /// Check the payload CRC-32 of the bitstream at `offset`
    pub fn verify_bitstream_crc(
        &mut self,
        offset: u64,
        expected_crc: u32,
        prefix_size: usize,
        payload_size: usize,
    ) -> Result<bool> {
        let actual = bitstream::payload_crc(&mut self.device, offset, prefix_size, payload_size)?;
        Ok(actual == expected_crc)
    }

    /// Check the stored bitstream at `offset` against its own metadata
    pub fn verify_bitstream(&mut self, offset: u64) -> Result<BitstreamReport> {
        bitstream::inspect(&mut self.device, offset)
    }

    /// Device serial number
    pub fn get_serial_number(&mut self) -> Result<String> {
        let field = self.map.serial_number;
        let raw = self.device.read_exact(field.offset, field.len)?;
        Ok(decode_ascii_field(&raw))
    }

    /// Device UUID
    pub fn get_uuid(&mut self) -> Result<String> {
        let field = self.map.uuid;
        let raw = self.device.read_exact(field.offset, field.len)?;
        Ok(decode_ascii_field(&raw))
    }

    /// Compare the warmboot section with the map's template or `template`
    pub fn verify_warmboot_section(&mut self, template: Option<&str>) -> Result<bool> {
        let raw = self
            .device
            .read_exact(self.map.warmboot_offset, WARMBOOT_LEN)?;
        let expected = template.unwrap_or(self.map.warmboot_template);
        Ok(hex::encode(raw) == expected)
    }

    /// Rewrite the warmboot section from the map's template
    ///
    /// Only bootloader version 2 and later can rewrite the section.
    pub fn flash_warmboot_section<P: FlashProgress + ?Sized>(
        &mut self,
        max_attempts: u32,
        progress: &mut P,
    ) -> Result<bool> {
        if self.map.version < 2 {
            log::error!(
                "Bootloader version {} cannot rewrite the warmboot section",
                self.map.version
            );
            return Err(Error::UnsupportedOperation);
        }
        let mut data = vec![0u8; WARMBOOT_LEN];
        hex::decode_to_slice(self.map.warmboot_template, &mut data).map_err(|_| Error::InvalidHex)?;
        self.flash_and_verify_with_progress(&data, self.map.warmboot_offset, max_attempts, true, progress)
    }
}

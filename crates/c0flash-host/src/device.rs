//! Raw block device backend
//!
//! The card is opened, positioned and closed again for every operation so
//! that nothing is cached between a write and the next status read.

use crate::error::{HostError, Result};

use c0flash_core::adapter::DeviceIo;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Configuration for a raw device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDeviceConfig {
    /// Device path (e.g., "/dev/sdb")
    pub device: PathBuf,
}

impl RawDeviceConfig {
    /// Create a configuration for `device`
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

/// C0-microSD seen as a block device by the host's card reader
#[derive(Debug, Clone)]
pub struct RawDevice {
    path: PathBuf,
}

impl RawDevice {
    /// Check that the device can be opened for reading and writing
    pub fn open(config: &RawDeviceConfig) -> Result<Self> {
        if config.device.as_os_str().is_empty() {
            return Err(HostError::NoDevice);
        }
        let device = Self {
            path: config.device.clone(),
        };
        device.open_file()?;
        log::debug!("raw: Using {}", device.path.display());
        Ok(device)
    }

    /// Device path
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn open_file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| HostError::open(&self.path.display().to_string(), e))
    }

    fn io_error(&self, offset: u64, source: std::io::Error) -> HostError {
        HostError::Io {
            path: self.path.display().to_string(),
            offset,
            source,
        }
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.open_file()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(offset, e))?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| self.io_error(offset, e))?;
        if buf.len() < len {
            log::debug!(
                "raw: Short read at 0x{:08X}: {} of {} bytes",
                offset,
                buf.len(),
                len
            );
        }
        Ok(buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = self.open_file()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(offset, e))?;
        file.write_all(data).map_err(|e| self.io_error(offset, e))?;
        file.flush().map_err(|e| self.io_error(offset, e))?;
        file.sync_data().map_err(|e| self.io_error(offset, e))?;
        Ok(data.len())
    }
}

fn report(e: HostError) -> c0flash_core::Error {
    log::error!("raw: {}", e);
    e.to_core()
}

impl DeviceIo for RawDevice {
    fn read(&mut self, offset: u64, len: usize) -> c0flash_core::Result<Vec<u8>> {
        self.read_at(offset, len).map_err(report)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> c0flash_core::Result<usize> {
        self.write_at(offset, data).map_err(report)
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(std::time::Duration::from_micros(us as u64));
    }
}

/// Parse backend options from key-value pairs
///
/// # Supported options
/// - `dev=PATH` - device path (required)
pub fn parse_options(options: &[(&str, &str)]) -> Result<RawDeviceConfig> {
    let mut device = None;

    for (key, value) in options {
        match *key {
            "dev" => device = Some(*value),
            _ => log::warn!("Unknown raw option: {}={}", key, value),
        }
    }

    device
        .filter(|d| !d.is_empty())
        .map(RawDeviceConfig::new)
        .ok_or(HostError::NoDevice)
}

//! Linux spidev bus
//!
//! spidev drives chip select per `SPI_IOC_MESSAGE`. To keep the card
//! selected across the many small messages of one SD transaction, every
//! transfer issued while selected sets `cs_change` on its last (only)
//! segment, which leaves CS asserted once the message completes. Releasing
//! clocks one idle byte with `cs_change` clear.

use crate::error::{Result, SpidevError};

use c0flash_core::bus::SpiBus;
use c0flash_core::error::Result as CoreResult;

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// SD cards must be identified at no more than 400 kHz
const DEFAULT_SPEED_HZ: u32 = 400_000;

/// Byte clocked out while reading
const FILL_BYTE: u8 = 0xFF;

/// `<linux/spi/spidev.h>` request codes
mod ioctl {
    use nix::{ioctl_write_ptr, request_code_write};

    const MAGIC: u8 = b'k';

    ioctl_write_ptr!(wr_mode, MAGIC, 1, u8);
    ioctl_write_ptr!(wr_bits_per_word, MAGIC, 3, u8);
    ioctl_write_ptr!(wr_max_speed_hz, MAGIC, 4, u32);

    /// `SPI_IOC_MESSAGE(n)`
    pub fn message(n: usize) -> libc::c_ulong {
        request_code_write!(MAGIC, 0, n * std::mem::size_of::<super::Transfer>()) as libc::c_ulong
    }
}

/// `struct spi_ioc_transfer`
#[repr(C)]
#[derive(Debug, Default)]
struct Transfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

/// Configuration for opening a spidev bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpidevConfig {
    /// spidev node, e.g. `/dev/spidev0.0`
    pub device: String,
    /// SPI clock in Hz
    pub speed_hz: u32,
    /// SPI mode (0-3); SD cards use mode 0
    pub mode: u8,
}

impl Default for SpidevConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            speed_hz: DEFAULT_SPEED_HZ,
            mode: 0,
        }
    }
}

impl SpidevConfig {
    /// Configuration for `device` at the identification clock
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    /// Use a different clock
    pub fn with_speed(mut self, speed_hz: u32) -> Self {
        self.speed_hz = speed_hz;
        self
    }
}

/// [`SpiBus`] over `/dev/spidevX.Y`
pub struct Spidev {
    fd: OwnedFd,
    speed_hz: u32,
    selected: bool,
}

fn setup<T>(
    what: &str,
    fd: RawFd,
    value: &T,
    call: unsafe fn(RawFd, *const T) -> nix::Result<libc::c_int>,
) -> std::io::Result<()> {
    log::trace!("spidev: Setting {}", what);
    // SAFETY: `value` outlives the call and matches the request's argument type.
    unsafe { call(fd, value) }
        .map(|_| ())
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

impl Spidev {
    /// Open and configure a spidev node
    pub fn open(config: &SpidevConfig) -> Result<Self> {
        if config.device.is_empty() {
            return Err(SpidevError::NoDevice);
        }

        let fd: OwnedFd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|source| SpidevError::OpenFailed {
                path: config.device.clone(),
                source,
            })?
            .into();
        let raw = fd.as_raw_fd();

        let (mode, bits, speed) = (config.mode, 8u8, config.speed_hz);
        setup("mode", raw, &mode, ioctl::wr_mode)
            .map_err(|source| SpidevError::SetModeFailed { mode, source })?;
        setup("word size", raw, &bits, ioctl::wr_bits_per_word)
            .map_err(|source| SpidevError::SetBitsPerWordFailed { bits, source })?;
        setup("clock", raw, &speed, ioctl::wr_max_speed_hz)
            .map_err(|source| SpidevError::SetSpeedFailed { speed, source })?;

        log::info!(
            "spidev: Opened {} (mode {}, {} kHz)",
            config.device,
            mode,
            speed / 1000
        );

        Ok(Self {
            fd,
            speed_hz: speed,
            selected: false,
        })
    }

    /// Clock in use
    pub fn speed_hz(&self) -> u32 {
        self.speed_hz
    }

    /// One single-segment message; `rx`, when given, must match `tx` in length
    fn message(&mut self, tx: &[u8], rx: Option<&mut [u8]>, keep_selected: bool) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let rx_buf = match rx {
            Some(buf) if buf.len() == tx.len() => buf.as_mut_ptr() as u64,
            Some(_) => {
                return Err(SpidevError::InvalidParameter(
                    "receive buffer length differs from transmit length".into(),
                ))
            }
            None => 0,
        };
        let len = u32::try_from(tx.len())
            .map_err(|_| SpidevError::InvalidParameter("transfer too long".into()))?;

        let transfer = Transfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf,
            len,
            speed_hz: self.speed_hz,
            bits_per_word: 8,
            cs_change: keep_selected as u8,
            ..Default::default()
        };

        // SAFETY: both buffers stay borrowed for the duration of the ioctl.
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                ioctl::message(1) as _,
                &transfer as *const Transfer,
            )
        };
        if ret < 0 {
            return Err(SpidevError::TransferFailed(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn flock(&mut self, operation: libc::c_int) -> Result<()> {
        // SAFETY: plain syscall on an fd we own.
        if unsafe { libc::flock(self.fd.as_raw_fd(), operation) } < 0 {
            return Err(SpidevError::LockFailed(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn report(e: SpidevError) -> c0flash_core::Error {
    log::error!("spidev: {}", e);
    e.to_core()
}

impl SpiBus for Spidev {
    fn write(&mut self, data: &[u8]) -> CoreResult<()> {
        let keep = self.selected;
        self.message(data, None, keep).map_err(report)
    }

    fn read(&mut self, buf: &mut [u8]) -> CoreResult<()> {
        let fill = vec![FILL_BYTE; buf.len()];
        let keep = self.selected;
        self.message(&fill, Some(buf), keep).map_err(report)
    }

    fn assert_cs(&mut self) -> CoreResult<()> {
        self.selected = true;
        Ok(())
    }

    fn release_cs(&mut self) -> CoreResult<()> {
        self.selected = false;
        self.message(&[FILL_BYTE], None, false).map_err(report)
    }

    fn lock(&mut self) -> CoreResult<()> {
        self.flock(libc::LOCK_EX).map_err(report)
    }

    fn unlock(&mut self) -> CoreResult<()> {
        self.flock(libc::LOCK_UN).map_err(report)
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(std::time::Duration::from_micros(u64::from(us)));
    }
}

/// Build a [`SpidevConfig`] from `dev=`, `spispeed=` (kHz) and `mode=` pairs
pub fn parse_options(options: &[(&str, &str)]) -> std::result::Result<SpidevConfig, String> {
    fn number<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
        value
            .parse()
            .map_err(|_| format!("Invalid {} value: {}", key, value))
    }

    let mut config = SpidevConfig::default();
    for &(key, value) in options {
        match key {
            "dev" => config.device = value.into(),
            "spispeed" => {
                let khz: u32 = number(key, value)?;
                config.speed_hz = khz
                    .checked_mul(1000)
                    .ok_or_else(|| format!("spispeed {} kHz is out of range", khz))?;
            }
            "mode" => match number::<u8>(key, value)? {
                mode @ 0..=3 => config.mode = mode,
                mode => return Err(format!("SPI mode {} is not one of 0-3", mode)),
            },
            _ => log::warn!("spidev: Ignoring unknown option {}={}", key, value),
        }
    }

    if config.device.is_empty() {
        return Err("missing dev=/dev/spidevX.Y".into());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_with_speed() {
        let config = parse_options(&[("dev", "/dev/spidev1.0"), ("spispeed", "8000")]).unwrap();
        assert_eq!(config.device, "/dev/spidev1.0");
        assert_eq!(config.speed_hz, 8_000_000);
        assert_eq!(config.mode, 0);
    }

    #[test]
    fn options_require_device() {
        assert!(parse_options(&[("spispeed", "400")]).is_err());
        assert!(parse_options(&[("dev", "/dev/spidev0.0"), ("mode", "4")]).is_err());
        assert!(parse_options(&[("dev", "/dev/spidev0.0"), ("spispeed", "fast")]).is_err());
        assert!(parse_options(&[("dev", "/dev/spidev0.0"), ("spispeed", "5000000")]).is_err());
    }

    #[test]
    fn transfer_struct_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<Transfer>(), 32);
    }

    #[test]
    fn message_request_code() {
        // SPI_IOC_MESSAGE(1) on Linux
        assert_eq!(ioctl::message(1), 0x4020_6B00);
    }

    #[test]
    fn open_missing_device() {
        let err = Spidev::open(&SpidevConfig::new("/nonexistent/spidev9.9"))
            .err()
            .unwrap();
        assert_eq!(err.to_core(), c0flash_core::Error::DeviceNotFound);
    }
}

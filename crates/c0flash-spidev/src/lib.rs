//! c0flash-spidev - Linux spidev bus
//!
//! Talks to a C0-microSD wired to a host SPI controller, exposed at
//! `/dev/spidevX.Y`, using the SD-over-SPI transport from `c0flash-core`.
//!
//! # Example
//!
//! ```no_run
//! use c0flash_core::adapter::{DeviceIo, SdBlockDevice};
//! use c0flash_core::sdspi::SdSpi;
//! use c0flash_spidev::{Spidev, SpidevConfig};
//!
//! let bus = Spidev::open(&SpidevConfig::new("/dev/spidev0.0").with_speed(4_000_000))?;
//! let mut card = SdBlockDevice::init(SdSpi::new(bus))?;
//! let status = card.read_exact(0x20000, 12)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Usage with the c0flash CLI
//!
//! ```bash
//! c0flash -t spidev:dev=/dev/spidev0.0,spispeed=4000 status
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with spidev support enabled (`CONFIG_SPI_SPIDEV`)
//! - Read/write access to `/dev/spidevX.Y`

pub mod device;
pub mod error;

pub use device::{parse_options, Spidev, SpidevConfig};
pub use error::{Result, SpidevError};

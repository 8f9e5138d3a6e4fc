//! c0flash-host - Raw block device access
//!
//! A C0-microSD plugged into an ordinary card reader shows up as a block
//! device (`/dev/sdX`, `/dev/mmcblkN`, `/dev/diskN`). Its registers and
//! flash are memory mapped into that block device, so plain positioned
//! reads and writes are all the host needs.
//!
//! # Example
//!
//! ```no_run
//! use c0flash_core::bootloader::Controller;
//! use c0flash_host::{RawDevice, RawDeviceConfig};
//!
//! let device = RawDevice::open(&RawDeviceConfig::new("/dev/sdb"))?;
//! let mut controller = Controller::connect(device, false)?;
//! println!("{}", controller.get_status()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # System Requirements
//!
//! Read/write access to the block device; usually root or membership of
//! the `disk` group.

pub mod device;
pub mod error;

pub use device::{parse_options, RawDevice, RawDeviceConfig};
pub use error::{HostError, Result};

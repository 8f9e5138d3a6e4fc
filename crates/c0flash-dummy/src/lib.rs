//! c0flash-dummy - In-memory C0-microSD emulator for testing
//!
//! [`DummyCard`] emulates a C0-microSD or C0-microSD+ at the block level and
//! [`SdCardEmulator`] puts any block device behind an SD-over-SPI bus. They
//! are useful for testing and development without real hardware:
//!
//! ```
//! use c0flash_core::adapter::SdBlockDevice;
//! use c0flash_core::bootloader::Controller;
//! use c0flash_core::sdspi::SdSpi;
//! use c0flash_dummy::{DummyCard, SdCardEmulator};
//!
//! let bus = SdCardEmulator::new(DummyCard::new_default());
//! let device = SdBlockDevice::init(SdSpi::new(bus))?;
//! let mut controller = Controller::connect(device, false)?;
//! println!("{}", controller.get_status()?);
//! # Ok::<(), c0flash_core::Error>(())
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
pub mod card;
#[cfg(feature = "alloc")]
pub mod sdcard;

#[cfg(feature = "alloc")]
pub use card::{DummyCard, DummyConfig, Personality, IDLE_COMMAND, INVERT_COMMAND};
#[cfg(feature = "alloc")]
pub use sdcard::{MemoryBacking, SdCardConfig, SdCardEmulator};

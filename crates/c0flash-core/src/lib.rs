//! c0flash-core - Core library for C0-microSD bring-up and flashing
//!
//! This crate implements the protocol logic shared by every way of talking
//! to a C0-microSD or C0-microSD+ card: the SD-over-SPI block transport,
//! the per-version memory maps, bitstream metadata parsing, and the
//! bootloader and compute controllers. It is `no_std` compatible; the
//! transport only needs a [`bus::SpiBus`], everything above the block
//! level needs the `alloc` feature.
//!
//! # Features
//!
//! - `std` - Enable standard library support (includes `alloc`)
//! - `alloc` - Enable the device adapter, controllers and JSON metadata
//!
//! # Example
//!
//! ```ignore
//! use c0flash_core::bootloader::Controller;
//!
//! fn show<D: c0flash_core::adapter::DeviceIo>(device: D) -> c0flash_core::Result<()> {
//!     let mut controller = Controller::connect(device, false)?;
//!     let status = controller.get_status()?;
//!     println!("{}", status);
//!     Ok(())
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

#[cfg(feature = "alloc")]
pub mod adapter;
#[cfg(feature = "alloc")]
pub mod bitstream;
#[cfg(feature = "alloc")]
pub mod bootloader;
pub mod bus;
#[cfg(feature = "alloc")]
pub mod compute;
pub mod error;
#[cfg(feature = "alloc")]
pub mod flash;
pub mod memory_map;
pub mod sdspi;
pub mod status;

pub use error::{Error, ErrorKind, Result};

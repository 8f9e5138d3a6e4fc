//! Backend selection for c0flash
//!
//! Every way of reaching a card ends in the same [`DeviceIo`] contract.
//! This crate turns a target string into one, so the CLI only ever sees a
//! [`BoxedDevice`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        CLI (c0flash)                         │
//! │   Controller / ComputeController over a BoxedDevice          │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                c0flash-device (this crate)                   │
//! │   "raw:dev=/dev/sdb" | "spidev:dev=..." | "dummy"            │
//! └──────────────────────────────────────────────────────────────┘
//!              │                  │                   │
//!              ▼                  ▼                   ▼
//! ┌────────────────┐  ┌──────────────────────┐  ┌────────────────┐
//! │  c0flash-host  │  │  c0flash-spidev      │  │ c0flash-dummy  │
//! │  RawDevice     │  │  Spidev + SdSpi      │  │ DummyCard      │
//! └────────────────┘  └──────────────────────┘  └────────────────┘
//! ```
//!
//! [`DeviceIo`]: c0flash_core::adapter::DeviceIo

mod registry;

pub use registry::{
    available_backends, backend_names_short, open_device, parse_target_params, BackendInfo,
    BoxedDevice, TargetParams,
};

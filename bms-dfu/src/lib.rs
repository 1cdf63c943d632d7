//! Firmware update of battery management systems over CAN.
//!
//! A [`Client`] drives one adapter channel. Frames received by the adapter
//! are moved to a lock-free queue by a background thread, the caller's thread
//! sends one command at a time and picks the response from that queue.
//! [`Updater`] runs the complete transfer of a [`Firmware`] image.

pub mod prelude {
    pub use crate::can::{Adapter as _, Receiver as _, Transmitter as _};
    pub use embedded_can::Frame as _;
}

pub mod can;
pub mod client;
pub mod crc;
pub mod device;
mod error;
pub mod executor;
pub mod firmware;
pub mod frame;
pub mod pump;
pub mod queue;
pub mod update;

pub use can::{Adapter, CanFrame, DeviceInfo, Receiver, Transmitter};
pub use client::{Client, ClientConfig, DataAck, Timing};
pub use crc::{crc16, crc32, CrcKind, FileCrc};
pub use device::{ApplicationVersion, BootloaderVersion, HardwareInfo, HardwareType, UpdateStatus};
pub use error::{Error, Result};
pub use firmware::Firmware;
pub use frame::{Command, PacketLen, Station};
pub use update::{Progress, Report, State, UpdateOptions, Updater};

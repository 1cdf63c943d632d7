//! Controller Area Network

use std::fmt;

use embedded_can::{Id, StandardId};

const fn standard_id(raw: u16) -> StandardId {
    match StandardId::new(raw) {
        Some(id) => id,
        None => panic!("standard identifiers are 11 bits wide"),
    }
}

/// Identifier of host to device command frames.
pub const CMD_ID: StandardId = standard_id(0x300);

/// Identifier of host to device packet data frames.
pub const DAT_ID: StandardId = standard_id(0x4C0);

/// Identifier of device to host response frames.
pub const RSP_ID: StandardId = standard_id(0x370);

/// Bus speeds accepted by [`Adapter::connect`], in bit/s.
pub const BITRATES: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

/// Number of CAN channels on the supported USB-CAN adapters.
pub const CHANNELS: u8 = 2;

pub fn is_supported_bitrate(bitrate: u32) -> bool {
    BITRATES.contains(&bitrate)
}

/// A CAN2.0 data frame with a standard (11bit) identifier.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: StandardId,
    len: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Creates a frame carrying all 8 data bytes.
    pub const fn standard(id: StandardId, data: [u8; 8]) -> Self {
        Self { id, len: 8, data }
    }

    pub fn standard_id(&self) -> StandardId {
        self.id
    }

    /// Returns all 8 data bytes. Bytes past the DLC read as zero.
    pub fn payload(&self) -> &[u8; 8] {
        &self.data
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03X} [{}] {:02X?}",
            self.id.as_raw(),
            self.len,
            &self.data[..self.len as usize]
        )
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let Id::Standard(id) = id.into() else {
            return None;
        };
        if data.len() > 8 {
            return None;
        }

        let mut frame = Self {
            id,
            len: data.len() as u8,
            data: [0; 8],
        };
        frame.data[..data.len()].copy_from_slice(data);
        Some(frame)
    }

    /// Remote frames are not used by the update protocol.
    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        Id::Standard(self.id)
    }

    fn dlc(&self) -> usize {
        self.len as usize
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// A CAN interface that is able to transmit frames.
pub trait Transmitter {
    type Error;

    /// Put a `CanFrame` in the transmit buffer.
    ///
    /// `WouldBlock` means the adapter did not accept the frame.
    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), Self::Error>;
}

/// A CAN interface that is able to receive frames.
pub trait Receiver {
    type Error;

    /// Number of received frames ready to be read without blocking.
    fn pending(&mut self) -> usize;

    /// Return the oldest received `CanFrame`.
    fn receive(&mut self) -> nb::Result<CanFrame, Self::Error>;
}

/// A USB-CAN adapter, one implementation per vendor.
pub trait Adapter {
    type Error: std::error::Error + Send + Sync + 'static;
    type Rx: Receiver<Error = Self::Error> + Send + 'static;
    type Tx: Transmitter<Error = Self::Error>;

    /// Opens the device and starts `channel` at `bitrate` bit/s.
    fn connect(&mut self, channel: u8, bitrate: u32) -> Result<(), Self::Error>;

    fn device_info(&mut self) -> Result<DeviceInfo, Self::Error>;

    /// Hands out the receive and transmit halves of the connected channel.
    ///
    /// The receive half is moved to the receive pump thread, the transmit
    /// half stays with the command executor.
    fn split(&mut self) -> Result<(Self::Rx, Self::Tx), Self::Error>;

    fn disconnect(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model)?;
        if let Some(serial_number) = &self.serial_number {
            write!(f, ", serial number {serial_number}")?;
        }
        if let Some(firmware_version) = &self.firmware_version {
            write!(f, ", firmware {firmware_version}")?;
        }
        Ok(())
    }
}

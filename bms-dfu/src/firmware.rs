//! Firmware image prepared for transfer.

use std::fs;
use std::path::Path;

use crate::crc::{CrcKind, FileCrc};
use crate::error::{Error, Result};
use crate::frame::PacketLen;

/// Value of erased flash, used to fill the last packet.
pub const PAD_BYTE: u8 = 0xFF;

/// Highest packet count, sequence numbers are 16 bit.
pub const MAX_PACKETS: usize = u16::MAX as usize;

/// A firmware image padded to a whole number of packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    image: Vec<u8>,
    original_len: usize,
    packet_len: PacketLen,
}

impl Firmware {
    /// Pads `image` with [`PAD_BYTE`] to a multiple of `packet_len`.
    ///
    /// Fails if the image needs more than [`MAX_PACKETS`] packets.
    pub fn new(mut image: Vec<u8>, packet_len: PacketLen) -> Result<Self> {
        let original_len = image.len();
        let packets = original_len.div_ceil(packet_len.bytes());
        if packets > MAX_PACKETS {
            return Err(Error::UnsupportedParameter {
                name: "packet count",
                value: u32::try_from(packets).unwrap_or(u32::MAX),
            });
        }
        image.resize(packets * packet_len.bytes(), PAD_BYTE);

        Ok(Self {
            image,
            original_len,
            packet_len,
        })
    }

    pub fn load(path: impl AsRef<Path>, packet_len: PacketLen) -> Result<Self> {
        Self::new(fs::read(path)?, packet_len)
    }

    /// Padded length in bytes.
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Length before padding.
    pub fn original_len(&self) -> usize {
        self.original_len
    }

    pub fn packet_len(&self) -> PacketLen {
        self.packet_len
    }

    pub fn packet_count(&self) -> u16 {
        (self.image.len() / self.packet_len.bytes()) as u16
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.image
    }

    /// Packets paired with their 1-based sequence number.
    pub fn packets(&self) -> impl ExactSizeIterator<Item = (u16, &[u8])> + '_ {
        (1..=self.packet_count()).zip(self.image.chunks_exact(self.packet_len.bytes()))
    }

    pub fn crc(&self, kind: CrcKind) -> FileCrc {
        FileCrc::compute(kind, &self.image)
    }
}

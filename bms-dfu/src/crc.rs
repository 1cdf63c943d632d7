//! Checksums used by the update protocol.

use std::fmt;

use crate::error::{Error, Result};

/// Seed of every CRC16 the protocol computes.
pub const CRC16_SEED: u16 = 0xFFFF;

/// Seed of the whole-file CRC32.
pub const CRC32_SEED: u32 = 0;

/// CRC16 over `buffer`, LSB first, polynomial x^16 + x^15 + x^2 + 1 (0xA001 reflected).
///
/// An empty buffer yields `seed`.
pub fn crc16(buffer: &[u8], seed: u16) -> u16 {
    buffer.iter().fold(seed, |mut crc, &byte| {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
        crc
    })
}

/// Reflected CRC32 (0xEDB88320) over `buffer`.
///
/// The seed is complemented on entry and the result on exit, so a seed of 0
/// gives the conventional CRC-32 and a previous result can be passed as seed
/// to continue over more data. An empty buffer yields `seed`.
pub fn crc32(buffer: &[u8], seed: u32) -> u32 {
    !buffer.iter().fold(!seed, |mut crc, &byte| {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            crc = (crc >> 1) ^ (0xEDB8_8320 & (crc & 1).wrapping_neg());
        }
        crc
    })
}

/// Checksum algorithm used to verify the whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcKind {
    #[default]
    Crc16 = 0,
    Crc32 = 1,
}

impl TryFrom<u8> for CrcKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CrcKind::Crc16),
            1 => Ok(CrcKind::Crc32),
            _ => Err(Error::UnsupportedParameter {
                name: "crc type",
                value: value.into(),
            }),
        }
    }
}

/// Checksum of a complete firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCrc {
    Crc16(u16),
    Crc32(u32),
}

impl FileCrc {
    pub fn compute(kind: CrcKind, image: &[u8]) -> Self {
        match kind {
            CrcKind::Crc16 => FileCrc::Crc16(crc16(image, CRC16_SEED)),
            CrcKind::Crc32 => FileCrc::Crc32(crc32(image, CRC32_SEED)),
        }
    }

    pub fn kind(&self) -> CrcKind {
        match self {
            FileCrc::Crc16(_) => CrcKind::Crc16,
            FileCrc::Crc32(_) => CrcKind::Crc32,
        }
    }
}

impl fmt::Display for FileCrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileCrc::Crc16(crc) => write!(f, "crc16 0x{crc:04X}"),
            FileCrc::Crc32(crc) => write!(f, "crc32 0x{crc:08X}"),
        }
    }
}

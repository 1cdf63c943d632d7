//! Identification data reported by the bootloader.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
    pub hardware: u8,
}

impl From<[u8; 5]> for BootloaderVersion {
    fn from(data: [u8; 5]) -> Self {
        Self {
            build: data[0],
            patch: data[1],
            minor: data[2],
            major: data[3],
            hardware: data[4],
        }
    }
}

impl fmt::Display for BootloaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{} (hardware {})",
            self.major, self.minor, self.patch, self.build, self.hardware
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplicationVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u16,
}

impl From<[u8; 5]> for ApplicationVersion {
    fn from(data: [u8; 5]) -> Self {
        Self {
            build: u16::from_le_bytes([data[0], data[1]]),
            patch: data[2],
            minor: data[3],
            major: data[4],
        }
    }
}

impl fmt::Display for ApplicationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }
}

/// Production data of the BMS board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub batch: u16,
}

impl From<[u8; 5]> for HardwareInfo {
    fn from(data: [u8; 5]) -> Self {
        Self {
            year: 2000 + u16::from(data[0]),
            month: data[1],
            day: data[2],
            batch: u16::from_le_bytes([data[3], data[4]]),
        }
    }
}

impl fmt::Display for HardwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} batch {}",
            self.year, self.month, self.day, self.batch
        )
    }
}

/// Five character board type, e.g. `LV48A`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareType(String);

impl HardwareType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<[u8; 5]> for HardwareType {
    fn from(data: [u8; 5]) -> Self {
        let text = String::from_utf8_lossy(&data);
        Self(text.trim_end_matches('\0').to_owned())
    }
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of an update as reported by `getUpdateStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Success,
    /// The station copies the image to its internal flash.
    Transferring,
    /// The station verifies the copied image.
    Verifying,
    Failed(u8),
}

impl UpdateStatus {
    pub const SUCCESS: u8 = 0xAA;
    pub const TRANSFERRING: u8 = 0x0C;
    pub const VERIFYING: u8 = 0x0D;

    pub fn is_in_progress(self) -> bool {
        matches!(self, UpdateStatus::Transferring | UpdateStatus::Verifying)
    }
}

impl From<u8> for UpdateStatus {
    fn from(code: u8) -> Self {
        match code {
            Self::SUCCESS => UpdateStatus::Success,
            Self::TRANSFERRING => UpdateStatus::Transferring,
            Self::VERIFYING => UpdateStatus::Verifying,
            code => UpdateStatus::Failed(code),
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStatus::Success => f.write_str("success"),
            UpdateStatus::Transferring => f.write_str("transferring"),
            UpdateStatus::Verifying => f.write_str("verifying"),
            UpdateStatus::Failed(code) => write!(f, "failed (0x{code:02X})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootloader_version_byte_order() {
        let version = BootloaderVersion::from([9, 3, 2, 1, 7]);
        assert_eq!(version.to_string(), "1.2.3.9 (hardware 7)");
    }

    #[test]
    fn application_build_is_little_endian() {
        let version = ApplicationVersion::from([0x34, 0x12, 3, 2, 1]);
        assert_eq!(version.build, 0x1234);
        assert_eq!(version.to_string(), "1.2.3.4660");
    }

    #[test]
    fn hardware_info_date() {
        let info = HardwareInfo::from([24, 5, 17, 0x39, 0x30]);
        assert_eq!(info.year, 2024);
        assert_eq!(info.to_string(), "2024-05-17 batch 12345");
    }

    #[test]
    fn hardware_type_trims_padding() {
        assert_eq!(HardwareType::from(*b"LV48A").as_str(), "LV48A");
        assert_eq!(HardwareType::from([b'L', b'V', b'1', 0, 0]).as_str(), "LV1");
    }

    #[test]
    fn update_status_codes() {
        assert_eq!(UpdateStatus::from(0xAA), UpdateStatus::Success);
        assert!(UpdateStatus::from(0x0C).is_in_progress());
        assert!(UpdateStatus::from(0x0D).is_in_progress());
        assert_eq!(UpdateStatus::from(0x05), UpdateStatus::Failed(0x05));
        assert!(!UpdateStatus::from(0x05).is_in_progress());
    }
}

//! Command and response frames of the update protocol.
//!
//! Over CAN every frame is 8 bytes. Commands are laid out as
//! `[len, address, opcode, data.., 0x00 padding]` where `len` counts the
//! address, opcode and data bytes. Responses mirror this with a status byte
//! of `opcode + 0x40` in place of the opcode.
//!
//! The RS-485 variant of the protocol wraps the same bytes in a start marker
//! and a CRC16 trailer. Only response validation still knows about it, see
//! [`Framing`].

use std::fmt;

use tracing::warn;

use crate::can::{CanFrame, CMD_ID, DAT_ID};
use crate::crc::{crc16, FileCrc, CRC16_SEED};
use crate::error::{Error, Result};

pub mod opcode {
    pub const PREPARE: u8 = 0x10;
    pub const GET_BOOTVER: u8 = 0x20;
    pub const GET_HWINFO: u8 = 0x21;
    pub const GET_HWTYPE: u8 = 0x22;
    pub const GET_APPVER: u8 = 0x23;
    pub const GET_PKTLEN: u8 = 0x28;
    pub const SET_PKTLEN: u8 = 0x29;
    pub const SET_APPLEN: u8 = 0x30;
    pub const SET_PKTNUM: u8 = 0x40;
    pub const VERIFY_PKTDAT: u8 = 0x45;
    pub const VERIFY_ALLDAT: u8 = 0x50;
    pub const UPDATE: u8 = 0x60;
    pub const GET_STATUS: u8 = 0x61;
}

/// Single byte confirmations following the status byte.
pub mod ack {
    pub const APP_LENGTH_OK: u8 = 0xA1;
    pub const SET_PKTLEN_OK: u8 = 0xA1;
    pub const SET_PKTNUM_OK: u8 = 0xA2;
    pub const XFER_DATA_OK: u8 = 0xA2;
    pub const VERIFY_DATA_OK: u8 = 0xA3;
    pub const VERIFY_ALL_OK: u8 = 0xA4;
}

/// Added to the opcode to form the status byte of a response.
pub const REPLY: u8 = 0x40;

/// Status byte acknowledging a packet data frame.
pub const XFER_DATA_STATUS: u8 = 0x8C;

/// Bytes a bootloader answers a prepare request with.
pub const PREPARE_MAGIC: [u8; 2] = [0xCC, 0xFE];

/// RS-485 start of a command response.
pub const SOP: u8 = 0x5B;

/// RS-485 start of a packet data response.
pub const DATA_SOP: u8 = 0x5C;

pub const LEN_OFFSET: usize = 0;
pub const ADDRESS_OFFSET: usize = 1;
pub const STATUS_OFFSET: usize = 2;
pub const DATA_OFFSET: usize = 3;

/// Builds a command payload from `template`, setting the station address and
/// padding to 8 bytes with 0x00. Template bytes past the 8th are ignored.
pub fn command_frame(template: &[u8], address: u8) -> [u8; 8] {
    let mut frame = [0; 8];
    let len = template.len().min(frame.len());
    frame[..len].copy_from_slice(&template[..len]);
    frame[ADDRESS_OFFSET] = address;
    frame
}

/// Wraps 8 bytes of packet data for transmission.
pub fn data_frame(chunk: &[u8; 8]) -> CanFrame {
    CanFrame::standard(DAT_ID, *chunk)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Prepare,
    GetBootloaderVersion,
    GetHardwareInfo,
    GetHardwareType,
    GetApplicationVersion,
    GetBatterySerialNumber,
    GetPacketLen,
    SetPacketLen,
    SetApplicationLen,
    SetPacketSeq,
    SetPacketAddr,
    SendPacketData,
    VerifyPacketData,
    VerifyAllData,
    UpdateStation,
    GetUpdateStatus,
}

impl Command {
    /// Packet data frames carry no opcode.
    pub const fn opcode(self) -> Option<u8> {
        use opcode::*;

        Some(match self {
            Command::Prepare => PREPARE,
            Command::GetBootloaderVersion => GET_BOOTVER,
            Command::GetHardwareInfo | Command::GetBatterySerialNumber => GET_HWINFO,
            Command::GetHardwareType => GET_HWTYPE,
            Command::GetApplicationVersion => GET_APPVER,
            Command::GetPacketLen => GET_PKTLEN,
            Command::SetPacketLen => SET_PKTLEN,
            Command::SetApplicationLen => SET_APPLEN,
            Command::SetPacketSeq | Command::SetPacketAddr => SET_PKTNUM,
            Command::SendPacketData => return None,
            Command::VerifyPacketData => VERIFY_PKTDAT,
            Command::VerifyAllData => VERIFY_ALLDAT,
            Command::UpdateStation => UPDATE,
            Command::GetUpdateStatus => GET_STATUS,
        })
    }

    /// Status byte of a response to this command.
    pub const fn status(self) -> u8 {
        match self.opcode() {
            Some(opcode) => opcode + REPLY,
            None => XFER_DATA_STATUS,
        }
    }

    /// What a well-formed response to this command looks like.
    pub const fn rule(self) -> Rule {
        use ack::*;

        match self {
            Command::Prepare => Rule::fixed(5).magic(PREPARE_MAGIC),
            Command::GetBootloaderVersion
            | Command::GetHardwareInfo
            | Command::GetHardwareType
            | Command::GetApplicationVersion => Rule::fixed(7),
            Command::GetBatterySerialNumber | Command::UpdateStation => Rule::variable(),
            Command::GetPacketLen => Rule::fixed(6),
            Command::SetPacketLen => Rule::fixed(3).ack(SET_PKTLEN_OK),
            Command::SetApplicationLen => Rule::fixed(7).ack(APP_LENGTH_OK),
            Command::SetPacketSeq => Rule::fixed(5).ack(SET_PKTNUM_OK),
            Command::SetPacketAddr => Rule::fixed(7).ack(SET_PKTNUM_OK),
            Command::SendPacketData => Rule::fixed(3).ack(XFER_DATA_OK),
            Command::VerifyPacketData => Rule::fixed(3).ack(VERIFY_DATA_OK),
            Command::VerifyAllData => Rule::fixed(3).ack(VERIFY_ALL_OK),
            Command::GetUpdateStatus => Rule::fixed(5),
        }
    }

    const fn sop(self) -> u8 {
        match self {
            Command::SendPacketData => DATA_SOP,
            _ => SOP,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Prepare => "prepare",
            Command::GetBootloaderVersion => "getBootloaderVer",
            Command::GetHardwareInfo => "getHardwareInfo",
            Command::GetHardwareType => "getHardwareType",
            Command::GetApplicationVersion => "getApplicationVer",
            Command::GetBatterySerialNumber => "getBatterySN",
            Command::GetPacketLen => "getPacketLen",
            Command::SetPacketLen => "setPacketLen",
            Command::SetApplicationLen => "setApplicationLen",
            Command::SetPacketSeq => "setPacketSeq",
            Command::SetPacketAddr => "setPacketAddr",
            Command::SendPacketData => "sendPacketData",
            Command::VerifyPacketData => "verifyPacketData",
            Command::VerifyAllData => "verifyAllData",
            Command::UpdateStation => "updateStation",
            Command::GetUpdateStatus => "getUpdateStatus",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    /// Expected value of the length byte, `None` when it varies.
    pub len: Option<u8>,
    pub check: Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    None,
    /// First data byte.
    Ack(u8),
    /// First two data bytes.
    Magic([u8; 2]),
}

impl Rule {
    const fn fixed(len: u8) -> Self {
        Self {
            len: Some(len),
            check: Check::None,
        }
    }

    const fn variable() -> Self {
        Self {
            len: None,
            check: Check::None,
        }
    }

    const fn ack(self, ack: u8) -> Self {
        Self {
            check: Check::Ack(ack),
            ..self
        }
    }

    const fn magic(self, magic: [u8; 2]) -> Self {
        Self {
            check: Check::Magic(magic),
            ..self
        }
    }
}

/// Response byte that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    FrameLength,
    Sop,
    Length,
    Status,
    Ack,
    Sequence,
    Crc,
    Eop,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::FrameLength => "frame length",
            Field::Sop => "SOP",
            Field::Length => "length",
            Field::Status => "command",
            Field::Ack => "ack",
            Field::Sequence => "seq",
            Field::Crc => "crc",
            Field::Eop => "EOP",
        })
    }
}

/// Negotiable packet length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketLen(u16);

impl PacketLen {
    pub const SUPPORTED: [u16; 7] = [8, 16, 32, 64, 128, 256, 512];

    /// Length the bootloader uses until told otherwise.
    pub const DEFAULT: PacketLen = PacketLen(128);

    pub fn new(len: u32) -> Result<Self> {
        match u16::try_from(len) {
            Ok(len) if Self::SUPPORTED.contains(&len) => Ok(PacketLen(len)),
            _ => Err(Error::UnsupportedParameter {
                name: "packet length",
                value: len,
            }),
        }
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// Number of bytes, for slicing.
    pub const fn bytes(self) -> usize {
        self.0 as usize
    }
}

impl Default for PacketLen {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for PacketLen {
    type Error = Error;

    fn try_from(len: u32) -> Result<Self> {
        Self::new(len)
    }
}

impl From<PacketLen> for u32 {
    fn from(len: PacketLen) -> u32 {
        len.0.into()
    }
}

impl fmt::Display for PacketLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stations an update request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Station {
    /// Only the addressed station.
    #[default]
    Current,
    /// Every station on the bus. Always sent to address 0.
    All,
}

/// A command together with its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Prepare,
    GetBootloaderVersion,
    GetHardwareInfo,
    GetHardwareType,
    GetApplicationVersion,
    GetBatterySerialNumber,
    GetPacketLen,
    SetPacketLen(PacketLen),
    SetApplicationLen(u32),
    SetPacketSeq(u16),
    SetPacketAddr(u32),
    VerifyPacketData(u16),
    VerifyAllData(FileCrc),
    UpdateStation(Station),
    GetUpdateStatus,
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Prepare => Command::Prepare,
            Request::GetBootloaderVersion => Command::GetBootloaderVersion,
            Request::GetHardwareInfo => Command::GetHardwareInfo,
            Request::GetHardwareType => Command::GetHardwareType,
            Request::GetApplicationVersion => Command::GetApplicationVersion,
            Request::GetBatterySerialNumber => Command::GetBatterySerialNumber,
            Request::GetPacketLen => Command::GetPacketLen,
            Request::SetPacketLen(_) => Command::SetPacketLen,
            Request::SetApplicationLen(_) => Command::SetApplicationLen,
            Request::SetPacketSeq(_) => Command::SetPacketSeq,
            Request::SetPacketAddr(_) => Command::SetPacketAddr,
            Request::VerifyPacketData(_) => Command::VerifyPacketData,
            Request::VerifyAllData(_) => Command::VerifyAllData,
            Request::UpdateStation(_) => Command::UpdateStation,
            Request::GetUpdateStatus => Command::GetUpdateStatus,
        }
    }

    /// Encodes the request for the station at `address`.
    pub fn encode(&self, address: u8) -> [u8; 8] {
        let mut template = [0; 8];
        let (opcode, data_len) = self.body(&mut template[DATA_OFFSET..]);
        template[LEN_OFFSET] = data_len as u8 + 2;
        template[STATUS_OFFSET] = opcode;

        let address = match self {
            Request::UpdateStation(Station::All) => 0,
            _ => address,
        };
        command_frame(&template[..DATA_OFFSET + data_len], address)
    }

    /// Encodes the request as a frame on the command identifier.
    pub fn to_frame(&self, address: u8) -> CanFrame {
        CanFrame::standard(CMD_ID, self.encode(address))
    }

    fn body(&self, out: &mut [u8]) -> (u8, usize) {
        use opcode::*;

        let mut put = |opcode: u8, data: &[u8]| {
            out[..data.len()].copy_from_slice(data);
            (opcode, data.len())
        };

        match *self {
            Request::Prepare => put(PREPARE, &[0x8C, 0xBE]),
            Request::GetBootloaderVersion => put(GET_BOOTVER, &[0x8C, 0xBE]),
            Request::GetHardwareInfo => put(GET_HWINFO, &[0x8D, 0xBA]),
            Request::GetHardwareType => put(GET_HWTYPE, &[0x7D, 0xBE]),
            Request::GetApplicationVersion => put(GET_APPVER, &[0x5E, 0xBE]),
            Request::GetBatterySerialNumber => put(GET_HWINFO, &[0x8D, 0xBE]),
            Request::GetPacketLen => put(GET_PKTLEN, &[0x5E, 0xBE]),
            Request::SetPacketLen(len) => put(SET_PKTLEN, &u32::from(len).to_le_bytes()),
            Request::SetApplicationLen(len) => put(SET_APPLEN, &len.to_le_bytes()),
            Request::SetPacketSeq(seq) => put(SET_PKTNUM, &seq.to_le_bytes()),
            Request::SetPacketAddr(addr) => put(SET_PKTNUM, &addr.to_le_bytes()),
            Request::VerifyPacketData(crc) => put(VERIFY_PKTDAT, &crc.to_le_bytes()),
            Request::VerifyAllData(FileCrc::Crc16(crc)) => {
                let [lo, hi] = crc.to_le_bytes();
                put(VERIFY_ALLDAT, &[0x00, lo, hi])
            }
            Request::VerifyAllData(FileCrc::Crc32(crc)) => {
                let [b0, b1, b2, b3] = crc.to_le_bytes();
                put(VERIFY_ALLDAT, &[0x01, b0, b1, b2, b3])
            }
            Request::UpdateStation(Station::Current) => put(UPDATE, &[0x51, 0x52]),
            Request::UpdateStation(Station::All) => put(UPDATE, &[0x52, 0x52]),
            Request::GetUpdateStatus => put(GET_STATUS, &[]),
        }
    }
}

/// How a response is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Addressing is carried by the CAN identifier, no markers.
    #[default]
    Can,
    /// Leading SOP marker and trailing CRC16 plus terminator.
    Rs485,
}

impl Framing {
    const fn shift(self) -> usize {
        match self {
            Framing::Can => 0,
            Framing::Rs485 => 1,
        }
    }
}

/// A received response payload.
#[derive(Debug, Clone, Copy)]
pub struct Response<'a> {
    bytes: &'a [u8],
    framing: Framing,
}

impl<'a> Response<'a> {
    pub fn new(bytes: &'a [u8], framing: Framing) -> Self {
        Self { bytes, framing }
    }

    pub fn can(bytes: &'a [u8]) -> Self {
        Self::new(bytes, Framing::Can)
    }

    /// Value of the length byte, counting address, status and data.
    pub fn length(&self) -> u8 {
        self.field(LEN_OFFSET).unwrap_or(0)
    }

    pub fn address(&self) -> u8 {
        self.field(ADDRESS_OFFSET).unwrap_or(0)
    }

    pub fn status(&self) -> u8 {
        self.field(STATUS_OFFSET).unwrap_or(0)
    }

    /// Data bytes covered by the length byte.
    pub fn data(&self) -> &'a [u8] {
        let start = self.framing.shift() + DATA_OFFSET;
        let end = (self.framing.shift() + ADDRESS_OFFSET + usize::from(self.length()))
            .min(self.bytes.len());
        self.bytes.get(start..end).unwrap_or(&[])
    }

    /// `K` data bytes starting at `at`, zero filled past the end of the data.
    pub fn data_array<const K: usize>(&self, at: usize) -> [u8; K] {
        let mut out = [0; K];
        if let Some(src) = self.data().get(at..) {
            let len = src.len().min(K);
            out[..len].copy_from_slice(&src[..len]);
        }
        out
    }

    pub fn u8_at(&self, at: usize) -> u8 {
        self.data().get(at).copied().unwrap_or(0)
    }

    pub fn u16_at(&self, at: usize) -> u16 {
        u16::from_le_bytes(self.data_array(at))
    }

    pub fn u32_at(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.data_array(at))
    }

    /// Checks the response against the rule of `command`.
    pub fn validate(&self, command: Command) -> Result<()> {
        let rule = command.rule();

        if self.framing == Framing::Rs485 {
            expect(command, Field::Sop, command.sop(), self.at(command, 0)?)?;
        }

        let len = self.at_field(command, LEN_OFFSET)?;
        if let Some(expected) = rule.len {
            expect(command, Field::Length, expected, len)?;
        }
        expect(
            command,
            Field::Status,
            command.status(),
            self.at_field(command, STATUS_OFFSET)?,
        )?;

        match rule.check {
            Check::None => {}
            Check::Ack(ack) => {
                expect(command, Field::Ack, ack, self.at_field(command, DATA_OFFSET)?)?
            }
            Check::Magic(magic) => {
                let received = [
                    self.at_field(command, DATA_OFFSET)?,
                    self.at_field(command, DATA_OFFSET + 1)?,
                ];
                if received != magic {
                    warn!("{command} response error: data received {received:02X?}, expected {magic:02X?}");
                    return Err(Error::NotInBootloader(received));
                }
            }
        }

        if self.framing == Framing::Rs485 {
            self.validate_trailer(command, len)?;
        }
        Ok(())
    }

    fn validate_trailer(&self, command: Command, len: u8) -> Result<()> {
        let start = self.framing.shift() + ADDRESS_OFFSET;
        let end = start + usize::from(len);
        let covered = self.bytes.get(start..end).ok_or_else(|| short(command, end, self.bytes.len()))?;

        let expected = crc16(covered, CRC16_SEED);
        let received = u16::from_le_bytes([self.at(command, end)?, self.at(command, end + 1)?]);
        if received != expected {
            warn!("{command} response error: crc received 0x{received:04X}, expected 0x{expected:04X}");
            return Err(Error::Validation {
                command,
                field: Field::Crc,
                expected: expected.into(),
                actual: received.into(),
            });
        }

        // Devices terminate RS-485 responses with the SOP marker.
        expect(command, Field::Eop, SOP, self.at(command, end + 2)?)
    }

    fn field(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.framing.shift() + offset).copied()
    }

    fn at_field(&self, command: Command, offset: usize) -> Result<u8> {
        self.at(command, self.framing.shift() + offset)
    }

    fn at(&self, command: Command, index: usize) -> Result<u8> {
        self.bytes
            .get(index)
            .copied()
            .ok_or_else(|| short(command, index + 1, self.bytes.len()))
    }
}

fn expect(command: Command, field: Field, expected: u8, actual: u8) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    warn!("{command} response error: {field} received 0x{actual:02X}, expected 0x{expected:02X}");
    Err(Error::Validation {
        command,
        field,
        expected: expected.into(),
        actual: actual.into(),
    })
}

fn short(command: Command, needed: usize, len: usize) -> Error {
    Error::Validation {
        command,
        field: Field::FrameLength,
        expected: needed as u32,
        actual: len as u32,
    }
}

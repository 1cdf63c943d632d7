//! Simulated BMS station behind an in-memory adapter.
//!
//! The transmit half answers every frame synchronously by queueing the
//! station's response for the receive half, the way a real bootloader
//! answers on the bus.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bms_dfu::can::{CMD_ID, DAT_ID, RSP_ID};
use bms_dfu::{crc16, crc32, Adapter, CanFrame, ClientConfig, DeviceInfo, Receiver, Timing, Transmitter};
use embedded_can::StandardId;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SimError(&'static str);

/// Misbehaviour injected into the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never answer this opcode.
    Silent(u8),
    /// Answer this opcode with a wrong ack byte.
    BadAck(u8),
    /// Echo a different value for this opcode.
    WrongEcho(u8),
    /// Answer prepare without the bootloader magic.
    NotInBootloader,
    /// Report a different packet length than configured.
    IgnorePacketLen,
    /// Leave out the second battery serial number frame.
    SerialGap,
}

#[derive(Debug)]
pub struct Station {
    pub address: u8,
    pub cells: u8,
    pub packet_len: u32,
    pub application_len: u32,
    pub serial: Vec<u8>,
    /// Status codes returned by successive polls, 0xAA once exhausted.
    pub statuses: VecDeque<u8>,
    /// Acknowledge every data frame on the data identifier.
    pub ack_data: bool,
    /// Frame with an unrelated identifier sent ahead of every response.
    pub noise: bool,
    pub fault: Option<Fault>,

    pub connected: Option<(u8, u32)>,
    pub sent: Vec<CanFrame>,
    pub seqs: Vec<u16>,
    pub packet: Vec<u8>,
    pub image: Vec<u8>,
    pub verified_packets: usize,
    pub verify_all: Vec<(u8, u32)>,
    pub update_requests: Vec<[u8; 8]>,
    pub status_polls: usize,
    /// Frames waiting for the receive half.
    pub inbox: VecDeque<CanFrame>,
}

impl Default for Station {
    fn default() -> Self {
        Self {
            address: 3,
            cells: 4,
            packet_len: 128,
            application_len: 0,
            serial: b"BMS-2024-000123".to_vec(),
            statuses: VecDeque::new(),
            ack_data: false,
            noise: false,
            fault: None,
            connected: None,
            sent: Vec::new(),
            seqs: Vec::new(),
            packet: Vec::new(),
            image: Vec::new(),
            verified_packets: 0,
            verify_all: Vec::new(),
            update_requests: Vec::new(),
            status_polls: 0,
            inbox: VecDeque::new(),
        }
    }
}

impl Station {
    fn reply(&mut self, status: u8, data: &[u8]) {
        self.reply_on(RSP_ID, status, data);
    }

    fn reply_on(&mut self, id: StandardId, status: u8, data: &[u8]) {
        if self.noise {
            self.inbox
                .push_back(CanFrame::standard(StandardId::new(0x123).unwrap(), [0xEE; 8]));
        }
        let mut payload = [0; 8];
        payload[0] = data.len() as u8 + 2;
        payload[1] = self.address;
        payload[2] = status;
        payload[3..3 + data.len()].copy_from_slice(data);
        self.inbox.push_back(CanFrame::standard(id, payload));
    }

    fn ack(&self, opcode: u8, ack: u8) -> u8 {
        if self.fault == Some(Fault::BadAck(opcode)) {
            ack ^ 0x01
        } else {
            ack
        }
    }

    fn echo(&self, opcode: u8, value: u32) -> u32 {
        if self.fault == Some(Fault::WrongEcho(opcode)) {
            value.wrapping_add(1)
        } else {
            value
        }
    }

    fn handle(&mut self, frame: &CanFrame) {
        self.sent.push(*frame);
        let p = *frame.payload();

        if frame.standard_id() == DAT_ID {
            self.packet.extend_from_slice(&p);
            if self.ack_data {
                let ack = self.ack(0x4C, 0xA2);
                self.reply_on(DAT_ID, 0x8C, &[ack]);
            }
            return;
        }
        if frame.standard_id() != CMD_ID {
            return;
        }

        let opcode = p[2];
        if opcode == 0x60 {
            self.update_requests.push(p);
            return;
        }
        if p[1] != self.address || self.fault == Some(Fault::Silent(opcode)) {
            return;
        }

        let u16_at = |i: usize| u16::from_le_bytes([p[i], p[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([p[i], p[i + 1], p[i + 2], p[i + 3]]);

        match opcode {
            0x10 => {
                let magic = if self.fault == Some(Fault::NotInBootloader) {
                    [0x00, 0x00]
                } else {
                    [0xCC, 0xFE]
                };
                let cells = self.cells;
                self.reply(0x50, &[magic[0], magic[1], cells]);
            }
            0x20 => self.reply(0x60, &[9, 3, 2, 1, 7]),
            0x21 if p[4] == 0xBA => self.reply(0x61, &[24, 5, 17, 0x39, 0x30]),
            0x21 => {
                let serial = self.serial.clone();
                for (seq, chunk) in serial.chunks(4).enumerate() {
                    if seq == 1 && self.fault == Some(Fault::SerialGap) {
                        continue;
                    }
                    let mut data = vec![seq as u8 + 1];
                    data.extend_from_slice(chunk);
                    self.reply(0x61, &data);
                }
            }
            0x22 => self.reply(0x62, b"LV48A"),
            0x23 => self.reply(0x63, &[0x34, 0x12, 3, 2, 1]),
            0x28 => {
                let len = if self.fault == Some(Fault::IgnorePacketLen) {
                    128
                } else {
                    self.packet_len
                };
                let b = len.to_le_bytes();
                self.reply(0x68, &[b[0], b[1], b[2], b[3]]);
            }
            0x29 => {
                self.packet_len = u32_at(3);
                let ack = self.ack(opcode, 0xA1);
                self.reply(0x69, &[ack]);
            }
            0x30 => {
                self.application_len = u32_at(3);
                let ack = self.ack(opcode, 0xA1);
                let b = self.echo(opcode, self.application_len).to_le_bytes();
                self.reply(0x70, &[ack, b[0], b[1], b[2], b[3]]);
            }
            0x40 if p[0] == 0x04 => {
                let seq = u16_at(3);
                self.seqs.push(seq);
                self.packet.clear();
                let ack = self.ack(opcode, 0xA2);
                let b = (self.echo(opcode, seq.into()) as u16).to_le_bytes();
                self.reply(0x80, &[ack, b[0], b[1]]);
            }
            0x40 => {
                let ack = self.ack(opcode, 0xA2);
                let b = self.echo(opcode, u32_at(3)).to_le_bytes();
                self.reply(0x80, &[ack, b[0], b[1], b[2], b[3]]);
            }
            0x45 => {
                let ok = crc16(&self.packet, 0xFFFF) == u16_at(3);
                if ok {
                    let packet = std::mem::take(&mut self.packet);
                    self.image.extend_from_slice(&packet);
                    self.verified_packets += 1;
                }
                let ack = self.ack(opcode, if ok { 0xA3 } else { 0x00 });
                self.reply(0x85, &[ack]);
            }
            0x50 => {
                let (kind, crc) = match p[3] {
                    0 => (0, u32::from(u16_at(4))),
                    _ => (1, u32_at(4)),
                };
                self.verify_all.push((kind, crc));
                let expected = match kind {
                    0 => u32::from(crc16(&self.image, 0xFFFF)),
                    _ => crc32(&self.image, 0),
                };
                let ack = self.ack(opcode, if crc == expected { 0xA4 } else { 0x00 });
                self.reply(0x90, &[ack]);
            }
            0x61 => {
                self.status_polls += 1;
                let status = self.statuses.pop_front().unwrap_or(0xAA);
                self.reply(0xA1, &[0x00, status, 0x00]);
            }
            _ => {}
        }
    }
}

/// Handle to a simulated station, shared by the adapter halves and the test.
#[derive(Clone, Default)]
pub struct SimBms(Arc<Mutex<Station>>);

impl SimBms {
    pub fn new(station: Station) -> Self {
        Self(Arc::new(Mutex::new(station)))
    }

    pub fn station(&self) -> MutexGuard<'_, Station> {
        self.0.lock().unwrap()
    }
}

pub struct SimRx(Arc<Mutex<Station>>);

pub struct SimTx(Arc<Mutex<Station>>);

impl Receiver for SimRx {
    type Error = SimError;

    fn pending(&mut self) -> usize {
        self.0.lock().unwrap().inbox.len()
    }

    fn receive(&mut self) -> nb::Result<CanFrame, SimError> {
        self.0
            .lock()
            .unwrap()
            .inbox
            .pop_front()
            .ok_or(nb::Error::WouldBlock)
    }
}

impl Transmitter for SimTx {
    type Error = SimError;

    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), SimError> {
        let mut station = self.0.lock().unwrap();
        if station.connected.is_none() {
            return Err(nb::Error::Other(SimError("not connected")));
        }
        station.handle(frame);
        Ok(())
    }
}

impl Adapter for SimBms {
    type Error = SimError;
    type Rx = SimRx;
    type Tx = SimTx;

    fn connect(&mut self, channel: u8, bitrate: u32) -> Result<(), SimError> {
        self.station().connected = Some((channel, bitrate));
        Ok(())
    }

    fn device_info(&mut self) -> Result<DeviceInfo, SimError> {
        Ok(DeviceInfo {
            model: "simulated adapter".into(),
            serial_number: Some("0001".into()),
            firmware_version: None,
        })
    }

    fn split(&mut self) -> Result<(SimRx, SimTx), SimError> {
        Ok((SimRx(self.0.clone()), SimTx(self.0.clone())))
    }

    fn disconnect(&mut self) -> Result<(), SimError> {
        self.station().connected = None;
        Ok(())
    }
}

/// Timing short enough for tests, long enough for a loaded machine.
pub fn config() -> ClientConfig {
    ClientConfig {
        timing: Timing {
            response: Duration::from_millis(500),
            status: Duration::from_millis(500),
            serial_idle: Duration::from_millis(100),
            frame_gap: Duration::ZERO,
            status_poll: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
        },
        ..ClientConfig::default()
    }
}

/// Payloads of all frames sent on `id`.
pub fn payloads(sent: &[CanFrame], id: StandardId) -> Vec<[u8; 8]> {
    sent.iter()
        .filter(|frame| frame.standard_id() == id)
        .map(|frame| *frame.payload())
        .collect()
}

//! Firmware transfer state machine.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::can::Adapter;
use crate::client::Client;
use crate::crc::{crc16, CrcKind, FileCrc, CRC16_SEED};
use crate::device::UpdateStatus;
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::frame::{PacketLen, Station};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Prepared,
    LengthNegotiated,
    /// Sending the packet with this sequence number.
    Transferring(u16),
    AllVerified,
    UpdateTriggered,
    Polling,
    Succeeded,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => f.write_str("idle"),
            State::Prepared => f.write_str("prepared"),
            State::LengthNegotiated => f.write_str("length negotiated"),
            State::Transferring(seq) => write!(f, "transferring packet {seq}"),
            State::AllVerified => f.write_str("all data verified"),
            State::UpdateTriggered => f.write_str("update triggered"),
            State::Polling => f.write_str("polling update status"),
            State::Succeeded => f.write_str("succeeded"),
            State::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOptions {
    /// Station receiving the image.
    pub address: u8,
    /// Stations told to install the image once it is verified.
    pub station: Station,
    /// Checksum of the whole image.
    pub crc: CrcKind,
}

/// Reported to the caller while an update runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    State(State),
    /// Packet `seq` of `total` was sent and verified.
    Packet { seq: u16, total: u16 },
    Status(UpdateStatus),
}

/// Summary of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub cells: u8,
    pub packets: u16,
    pub bytes: usize,
    pub crc: FileCrc,
    pub elapsed: Duration,
}

/// Pushes one image to one station.
pub struct Updater<'a, A: Adapter> {
    client: &'a mut Client<A>,
    options: UpdateOptions,
    state: State,
}

impl<'a, A: Adapter> Updater<'a, A> {
    pub fn new(client: &'a mut Client<A>, options: UpdateOptions) -> Self {
        Self {
            client,
            options,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Runs the whole update.
    ///
    /// Stops at the first failing step and reports the state it failed in.
    /// The station has to be prepared again before another attempt.
    pub fn run(&mut self, firmware: &Firmware, mut progress: impl FnMut(Progress)) -> Result<Report> {
        self.state = State::Idle;
        let start = Instant::now();

        match self.transfer(firmware, &mut progress) {
            Ok(mut report) => {
                report.elapsed = start.elapsed();
                info!(
                    "update of station {} finished in {:.1?}",
                    self.options.address, report.elapsed
                );
                Ok(report)
            }
            Err(e) => {
                let state = self.state;
                error!("update aborted while {state}: {e}");
                self.enter(State::Failed, &mut progress);
                Err(Error::Aborted {
                    state,
                    source: Box::new(e),
                })
            }
        }
    }

    fn enter(&mut self, state: State, progress: &mut impl FnMut(Progress)) {
        info!("{} -> {}", self.state, state);
        self.state = state;
        progress(Progress::State(state));
    }

    fn transfer(&mut self, firmware: &Firmware, progress: &mut impl FnMut(Progress)) -> Result<Report> {
        let UpdateOptions {
            address,
            station,
            crc,
        } = self.options;
        let packet_len = firmware.packet_len();
        let total = firmware.packet_count();
        let image_len = u32::from(total) * u32::from(packet_len.get());

        let cells = self.client.prepare(address)?;
        self.enter(State::Prepared, progress);

        if packet_len != PacketLen::DEFAULT {
            self.client.set_packet_len(address, packet_len.into())?;
            let negotiated = self.client.packet_len(address)?;
            if negotiated != u32::from(packet_len) {
                return Err(Error::EchoMismatch {
                    what: "packet length",
                    sent: packet_len.into(),
                    echoed: negotiated,
                });
            }
        }
        self.client.set_application_len(address, image_len)?;
        self.enter(State::LengthNegotiated, progress);

        for (seq, packet) in firmware.packets() {
            self.enter(State::Transferring(seq), progress);
            self.client.set_packet_seq(address, seq)?;
            self.client.send_packet_data(packet)?;
            self.client.verify_packet_data(address, crc16(packet, CRC16_SEED))?;
            debug!("packet {seq}/{total} verified");
            progress(Progress::Packet { seq, total });
        }

        let crc = firmware.crc(crc);
        self.client.verify_all_data(address, crc)?;
        self.enter(State::AllVerified, progress);

        match station {
            Station::Current => self.client.update_current_station(address)?,
            Station::All => self.client.update_all_stations()?,
        }
        self.enter(State::UpdateTriggered, progress);

        self.enter(State::Polling, progress);
        let status_poll = self.client.config().timing.status_poll;
        loop {
            let status = self.client.update_status(address)?;
            progress(Progress::Status(status));
            match status {
                UpdateStatus::Success => break,
                UpdateStatus::Transferring | UpdateStatus::Verifying => {
                    debug!("update {status}");
                    thread::sleep(status_poll);
                }
                UpdateStatus::Failed(code) => return Err(Error::UpdateFailed(code)),
            }
        }
        self.enter(State::Succeeded, progress);

        Ok(Report {
            cells,
            packets: total,
            bytes: firmware.len(),
            crc,
            elapsed: Duration::ZERO,
        })
    }
}

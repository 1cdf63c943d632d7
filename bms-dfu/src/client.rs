//! Caller facing API of the update protocol.

use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::can::{
    is_supported_bitrate, Adapter, CanFrame, DeviceInfo, CHANNELS, DAT_ID, RSP_ID,
};
use crate::crc::FileCrc;
use crate::device::{
    ApplicationVersion, BootloaderVersion, HardwareInfo, HardwareType, UpdateStatus,
};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::frame::{data_frame, Command, Field, Framing, PacketLen, Request, Response, Station};
use crate::pump::Pump;
use crate::queue;

/// Number of slots of the inbound frame queue.
pub const INBOX_CAPACITY: usize = 256;

/// Timeouts and delays of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait for the response to an ordinary command.
    pub response: Duration,
    /// Wait for the response to `getUpdateStatus`.
    pub status: Duration,
    /// Silence that ends a multi-frame battery serial number.
    pub serial_idle: Duration,
    /// Pause after each packet data frame when not waiting for an ack.
    pub frame_gap: Duration,
    /// Pause between status polls while the update is in progress.
    pub status_poll: Duration,
    /// Sleep of the executor while the inbound queue is empty.
    pub poll_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(3),
            status: Duration::from_secs(5),
            serial_idle: Duration::from_secs(1),
            frame_gap: Duration::from_millis(5),
            status_poll: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// How packet data frames are paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataAck {
    /// Sleep [`Timing::frame_gap`] after every frame.
    #[default]
    FixedDelay,
    /// Wait for an acknowledgement on [`DAT_ID`] after every frame.
    WaitForAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientConfig {
    pub timing: Timing,
    pub data_ack: DataAck,
    pub framing: Framing,
}

struct Link<A: Adapter> {
    executor: Executor<A::Tx, INBOX_CAPACITY>,
    pump: Pump<A::Rx>,
}

/// Talks to BMS bootloaders through one adapter channel.
pub struct Client<A: Adapter> {
    adapter: A,
    config: ClientConfig,
    link: Option<Link<A>>,
}

impl<A: Adapter> Client<A> {
    pub fn new(adapter: A, config: ClientConfig) -> Self {
        Self {
            adapter,
            config,
            link: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Opens `channel` at `bitrate` bit/s and starts receiving.
    ///
    /// The arguments are checked before the adapter is touched.
    pub fn connect(&mut self, channel: u8, bitrate: u32) -> Result<()> {
        if channel >= CHANNELS {
            return Err(Error::UnsupportedParameter {
                name: "channel",
                value: channel.into(),
            });
        }
        if !is_supported_bitrate(bitrate) {
            return Err(Error::UnsupportedParameter {
                name: "bitrate",
                value: bitrate,
            });
        }
        self.disconnect()?;

        self.adapter.connect(channel, bitrate).map_err(Error::transport)?;
        let link = self.start_link();
        if link.is_err() {
            let _ = self.adapter.disconnect();
        }
        self.link = Some(link?);

        info!("connected to channel {channel} at {bitrate} bit/s");
        Ok(())
    }

    fn start_link(&mut self) -> Result<Link<A>> {
        let (rx, tx) = self.adapter.split().map_err(Error::transport)?;
        let (producer, consumer) = queue::channel();
        let pump = Pump::spawn(rx, producer).map_err(Error::transport)?;
        let executor = Executor::new(tx, consumer, self.config.timing.poll_interval);
        Ok(Link { executor, pump })
    }

    /// Stops receiving and closes the adapter. Does nothing when not connected.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        drop(link.executor);
        link.pump.stop();
        self.adapter.disconnect().map_err(Error::transport)?;
        info!("disconnected");
        Ok(())
    }

    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        if self.link.is_none() {
            return Err(Error::NotConnected);
        }
        self.adapter.device_info().map_err(Error::transport)
    }

    fn executor(&mut self) -> Result<&mut Executor<A::Tx, INBOX_CAPACITY>> {
        self.link
            .as_mut()
            .map(|link| &mut link.executor)
            .ok_or(Error::NotConnected)
    }

    fn response<'a>(&self, frame: &'a CanFrame) -> Response<'a> {
        Response::new(frame.payload(), self.config.framing)
    }

    /// Sends `request` to `address` and returns the validated response.
    pub fn command(&mut self, address: u8, request: Request) -> Result<CanFrame> {
        let command = request.command();
        let timeout = match command {
            Command::GetUpdateStatus => self.config.timing.status,
            _ => self.config.timing.response,
        };
        let frame = request.to_frame(address);
        let response = self.executor()?.execute(command, &frame, RSP_ID, timeout)?;
        self.response(&response).validate(command)?;
        Ok(response)
    }

    /// Switches the station at `address` into update mode and returns its
    /// number of cells.
    pub fn prepare(&mut self, address: u8) -> Result<u8> {
        let frame = self.command(address, Request::Prepare)?;
        let cells = self.response(&frame).u8_at(2);
        info!("station {address} is in bootloader mode, {cells} cells");
        Ok(cells)
    }

    pub fn bootloader_version(&mut self, address: u8) -> Result<BootloaderVersion> {
        let frame = self.command(address, Request::GetBootloaderVersion)?;
        Ok(self.response(&frame).data_array::<5>(0).into())
    }

    pub fn application_version(&mut self, address: u8) -> Result<ApplicationVersion> {
        let frame = self.command(address, Request::GetApplicationVersion)?;
        Ok(self.response(&frame).data_array::<5>(0).into())
    }

    pub fn hardware_type(&mut self, address: u8) -> Result<HardwareType> {
        let frame = self.command(address, Request::GetHardwareType)?;
        Ok(self.response(&frame).data_array::<5>(0).into())
    }

    pub fn hardware_info(&mut self, address: u8) -> Result<HardwareInfo> {
        let frame = self.command(address, Request::GetHardwareInfo)?;
        Ok(self.response(&frame).data_array::<5>(0).into())
    }

    /// Reads the battery serial number, which spans several frames.
    ///
    /// Each frame carries a sequence number counting from 1. The number ends
    /// when the station stays silent for [`Timing::serial_idle`].
    pub fn battery_serial_number(&mut self, address: u8) -> Result<String> {
        let command = Command::GetBatterySerialNumber;
        let Timing {
            response: first_timeout,
            serial_idle,
            ..
        } = self.config.timing;

        let executor = self.executor()?;
        executor.drain();
        executor.send(command, &Request::GetBatterySerialNumber.to_frame(address))?;

        let mut serial = Vec::new();
        let mut seq: u8 = 1;
        loop {
            let timeout = if seq == 1 { first_timeout } else { serial_idle };
            let frame = match self.executor()?.receive(command, RSP_ID, timeout) {
                Ok(frame) => frame,
                Err(Error::ResponseTimeout { .. }) if seq > 1 => break,
                Err(e) => return Err(e),
            };

            let response = self.response(&frame);
            response.validate(command)?;
            let data = response.data();
            let received = data.first().copied().unwrap_or(0);
            if received != seq {
                return Err(Error::Validation {
                    command,
                    field: Field::Sequence,
                    expected: seq.into(),
                    actual: received.into(),
                });
            }
            serial.extend_from_slice(data.get(1..).unwrap_or(&[]));
            debug!("serial number frame {seq}, {} bytes", data.len().saturating_sub(1));
            seq = seq.wrapping_add(1);
        }

        let serial = String::from_utf8_lossy(&serial);
        Ok(serial.trim_end_matches('\0').trim().to_owned())
    }

    pub fn packet_len(&mut self, address: u8) -> Result<u32> {
        let frame = self.command(address, Request::GetPacketLen)?;
        Ok(self.response(&frame).u32_at(0))
    }

    /// Rejects unsupported lengths before anything is sent.
    pub fn set_packet_len(&mut self, address: u8, len: u32) -> Result<PacketLen> {
        let len = PacketLen::new(len)?;
        self.command(address, Request::SetPacketLen(len))?;
        Ok(len)
    }

    pub fn set_application_len(&mut self, address: u8, len: u32) -> Result<()> {
        let frame = self.command(address, Request::SetApplicationLen(len))?;
        let echoed = self.response(&frame).u32_at(1);
        echo("application length", len, echoed)
    }

    pub fn set_packet_seq(&mut self, address: u8, seq: u16) -> Result<()> {
        let frame = self.command(address, Request::SetPacketSeq(seq))?;
        let echoed = self.response(&frame).u16_at(1);
        echo("packet sequence", seq.into(), echoed.into())
    }

    pub fn set_packet_addr(&mut self, address: u8, addr: u32) -> Result<()> {
        let frame = self.command(address, Request::SetPacketAddr(addr))?;
        let echoed = self.response(&frame).u32_at(1);
        echo("packet address", addr, echoed)
    }

    /// Sends one packet as consecutive 8 byte data frames.
    ///
    /// The packet must have one of the supported packet lengths, anything
    /// else is rejected before a frame is sent.
    pub fn send_packet_data(&mut self, packet: &[u8]) -> Result<()> {
        let command = Command::SendPacketData;
        let ClientConfig {
            timing,
            data_ack,
            framing,
        } = self.config;
        PacketLen::new(u32::try_from(packet.len()).unwrap_or(u32::MAX))?;

        let executor = self.executor()?;
        executor.drain();
        for chunk in packet.chunks_exact(8) {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(chunk);
            let frame = data_frame(&bytes);

            match data_ack {
                DataAck::FixedDelay => {
                    executor.send(command, &frame)?;
                    thread::sleep(timing.frame_gap);
                }
                DataAck::WaitForAck => {
                    let ack = executor.execute(command, &frame, DAT_ID, timing.response)?;
                    Response::new(ack.payload(), framing).validate(command)?;
                }
            }
        }
        Ok(())
    }

    pub fn verify_packet_data(&mut self, address: u8, crc: u16) -> Result<()> {
        self.command(address, Request::VerifyPacketData(crc))?;
        Ok(())
    }

    pub fn verify_all_data(&mut self, address: u8, crc: FileCrc) -> Result<()> {
        self.command(address, Request::VerifyAllData(crc))?;
        Ok(())
    }

    /// Tells the station at `address` to install the image. No response is
    /// expected.
    pub fn update_current_station(&mut self, address: u8) -> Result<()> {
        self.trigger(Request::UpdateStation(Station::Current).to_frame(address))
    }

    /// Tells every station on the bus to install the image.
    pub fn update_all_stations(&mut self) -> Result<()> {
        self.trigger(Request::UpdateStation(Station::All).to_frame(0))
    }

    fn trigger(&mut self, frame: CanFrame) -> Result<()> {
        let executor = self.executor()?;
        executor.drain();
        executor.send(Command::UpdateStation, &frame)
    }

    pub fn update_status(&mut self, address: u8) -> Result<UpdateStatus> {
        let frame = self.command(address, Request::GetUpdateStatus)?;
        Ok(self.response(&frame).u8_at(1).into())
    }
}

impl<A: Adapter> Drop for Client<A> {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

fn echo(what: &'static str, sent: u32, echoed: u32) -> Result<()> {
    if sent == echoed {
        Ok(())
    } else {
        Err(Error::EchoMismatch { what, sent, echoed })
    }
}

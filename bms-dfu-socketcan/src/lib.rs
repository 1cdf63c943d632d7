//! [`bms_dfu::Adapter`] for Linux SocketCAN interfaces.
//!
//! Channel `n` maps to the network interface `<prefix><n>`, `can0` and
//! `can1` with the default prefix. The bus speed belongs to the interface
//! configuration (`ip link set can0 type can bitrate 500000`) and is not
//! changed here.

#![cfg(target_os = "linux")]

use std::{fmt, io};

use bms_dfu::{
    can::{self, DAT_ID, RSP_ID},
    prelude::*,
    DeviceInfo,
};
use embedded_can::Id;
use socketcan::{CanDataFrame, CanFilter, CanFrame, CanSocket, Socket, SocketOptions};
use tracing::{debug, info, trace};

pub const DEFAULT_PREFIX: &str = "can";

const STANDARD_MASK: u32 = 0x7FF;

#[derive(Debug)]
pub enum Error {
    NotConnected,
    InvalidFrame(can::CanFrame),
    Io { interface: String, source: io::Error },
}

impl Error {
    fn io(interface: &str, source: io::Error) -> Self {
        Error::Io {
            interface: interface.to_owned(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotConnected => write!(f, "interface is not open"),
            Error::InvalidFrame(frame) => write!(f, "cannot send {frame:?}"),
            Error::Io { interface, source } => write!(f, "{interface}: {source}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

struct Sockets {
    name: String,
    rx: CanSocket,
    tx: CanSocket,
}

pub struct Interface {
    prefix: String,
    open: Option<Sockets>,
    name: Option<String>,
}

impl Interface {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    /// Channels map to `<prefix>0` and `<prefix>1`, e.g. `vcan` for virtual
    /// interfaces.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            open: None,
            name: None,
        }
    }

    pub fn interface_name(&self, channel: u8) -> String {
        format!("{}{}", self.prefix, channel)
    }
}

impl Default for Interface {
    fn default() -> Self {
        Self::new()
    }
}

fn open(name: &str) -> io::Result<Sockets> {
    let rx = CanSocket::open(name)?;
    rx.set_filters(&[
        CanFilter::new(RSP_ID.as_raw().into(), STANDARD_MASK),
        CanFilter::new(DAT_ID.as_raw().into(), STANDARD_MASK),
    ])?;
    rx.set_nonblocking(true)?;

    // Keep our own data frames away from the receive socket.
    let tx = CanSocket::open(name)?;
    tx.set_loopback(false)?;

    // Drop frames received before the caller is ready for them.
    let mut stale = 0;
    while rx.read_frame().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        debug!("{name}: dropped {stale} stale frames");
    }

    Ok(Sockets {
        name: name.to_owned(),
        rx,
        tx,
    })
}

impl can::Adapter for Interface {
    type Error = Error;
    type Rx = Rx;
    type Tx = Tx;

    fn connect(&mut self, channel: u8, bitrate: u32) -> Result<(), Error> {
        let name = self.interface_name(channel);
        let sockets = open(&name).map_err(|e| Error::io(&name, e))?;
        info!("{name} opened, bus speed {bitrate} bit/s is taken from the interface configuration");
        self.open = Some(sockets);
        self.name = Some(name);
        Ok(())
    }

    fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let name = self.name.as_deref().ok_or(Error::NotConnected)?;
        Ok(DeviceInfo {
            model: format!("SocketCAN {name}"),
            serial_number: None,
            firmware_version: None,
        })
    }

    fn split(&mut self) -> Result<(Rx, Tx), Error> {
        let Sockets { name, rx, tx } = self.open.take().ok_or(Error::NotConnected)?;
        let rx = Rx {
            name: name.clone(),
            socket: rx,
            stash: None,
        };
        Ok((rx, Tx { name, socket: tx }))
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.open = None;
        if let Some(name) = self.name.take() {
            info!("{name} closed");
        }
        Ok(())
    }
}

fn from_socketcan(frame: &CanFrame) -> Option<can::CanFrame> {
    let CanFrame::Data(frame) = frame else {
        return None;
    };
    match frame.id() {
        Id::Standard(id) => can::CanFrame::new(id, frame.data()),
        Id::Extended(_) => None,
    }
}

fn to_socketcan(frame: &can::CanFrame) -> Option<CanFrame> {
    CanDataFrame::new(frame.standard_id(), frame.data()).map(CanFrame::Data)
}

pub struct Rx {
    name: String,
    socket: CanSocket,
    stash: Option<io::Result<can::CanFrame>>,
}

impl Rx {
    /// Reads the next usable frame into the stash, skipping remote, error
    /// and extended frames.
    fn fill(&mut self) {
        while self.stash.is_none() {
            match self.socket.read_frame() {
                Ok(frame) => match from_socketcan(&frame) {
                    Some(frame) => self.stash = Some(Ok(frame)),
                    None => trace!("{}: ignoring {frame:?}", self.name),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => self.stash = Some(Err(e)),
            }
        }
    }
}

impl can::Receiver for Rx {
    type Error = Error;

    /// SocketCAN has no queue depth, reports whether a frame is waiting.
    fn pending(&mut self) -> usize {
        self.fill();
        usize::from(self.stash.is_some())
    }

    fn receive(&mut self) -> nb::Result<can::CanFrame, Error> {
        self.fill();
        match self.stash.take() {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(nb::Error::Other(Error::io(&self.name, e))),
            None => Err(nb::Error::WouldBlock),
        }
    }
}

pub struct Tx {
    name: String,
    socket: CanSocket,
}

impl can::Transmitter for Tx {
    type Error = Error;

    fn transmit(&mut self, frame: &can::CanFrame) -> nb::Result<(), Error> {
        let out = to_socketcan(frame).ok_or(nb::Error::Other(Error::InvalidFrame(*frame)))?;
        match self.socket.write_frame(&out) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(Error::io(&self.name, e))),
        }
    }
}

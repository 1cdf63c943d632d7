use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::frame::{Command, Field};
use crate::update::State;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to transmit {command} frame")]
    TransmitFailed {
        command: Command,
        #[source]
        source: BoxError,
    },

    #[error("no {command} response within {timeout:?}")]
    ResponseTimeout { command: Command, timeout: Duration },

    #[error("{command} response: {field} received 0x{actual:02X}, expected 0x{expected:02X}")]
    Validation {
        command: Command,
        field: Field,
        expected: u32,
        actual: u32,
    },

    #[error("device is not in bootloader mode: received {0:02X?}, expected [CC, FE]")]
    NotInBootloader([u8; 2]),

    #[error("{what} mismatch: sent {sent}, device reported {echoed}")]
    EchoMismatch {
        what: &'static str,
        sent: u32,
        echoed: u32,
    },

    #[error("unsupported {name} {value}")]
    UnsupportedParameter { name: &'static str, value: u32 },

    #[error("update failed, device status 0x{0:02X}")]
    UpdateFailed(u8),

    #[error("failed to read firmware image")]
    Io(#[from] io::Error),

    #[error("adapter is not connected")]
    NotConnected,

    #[error("adapter error")]
    Transport(#[source] BoxError),

    #[error("update aborted while {state}")]
    Aborted {
        state: State,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn transport(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Transport(Box::new(error))
    }

    /// The error that caused an update to abort, or `self`.
    pub fn root(&self) -> &Error {
        match self {
            Error::Aborted { source, .. } => source.root(),
            _ => self,
        }
    }
}

//! One command at a time: transmit, then wait for the matching response.

use std::time::{Duration, Instant};

use embedded_can::StandardId;
use tracing::debug;

use crate::can::{CanFrame, Transmitter};
use crate::error::{Error, Result};
use crate::frame::Command;
use crate::queue::Consumer;

pub struct Executor<T, const N: usize> {
    tx: T,
    inbox: Consumer<CanFrame, N>,
    poll_interval: Duration,
}

impl<T, const N: usize> Executor<T, N>
where
    T: Transmitter,
    T::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn new(tx: T, inbox: Consumer<CanFrame, N>, poll_interval: Duration) -> Self {
        Self {
            tx,
            inbox,
            poll_interval,
        }
    }

    /// Transmits `frame` without waiting for a response.
    pub fn send(&mut self, command: Command, frame: &CanFrame) -> Result<()> {
        debug!("tx {command} {frame:?}");
        match self.tx.transmit(frame) {
            Ok(()) => Ok(()),
            Err(nb::Error::Other(e)) => Err(Error::TransmitFailed {
                command,
                source: Box::new(e),
            }),
            Err(nb::Error::WouldBlock) => Err(Error::TransmitFailed {
                command,
                source: "transmit buffer full".into(),
            }),
        }
    }

    /// Waits up to `timeout` for a frame with identifier `expected`.
    ///
    /// Frames with any other identifier are discarded, they do not extend
    /// the deadline.
    pub fn receive(
        &mut self,
        command: Command,
        expected: StandardId,
        timeout: Duration,
    ) -> Result<CanFrame> {
        let deadline = Instant::now() + timeout;
        while let Some(frame) = self.inbox.pop_until(deadline, self.poll_interval) {
            if frame.standard_id() == expected {
                debug!("rx {command} {frame:?}");
                return Ok(frame);
            }
            debug!("discarding {frame:?} while waiting for {command}");
        }
        Err(Error::ResponseTimeout { command, timeout })
    }

    /// Sends `frame` and returns the first response with identifier `expected`.
    ///
    /// Frames left over from earlier commands are dropped first.
    pub fn execute(
        &mut self,
        command: Command,
        frame: &CanFrame,
        expected: StandardId,
        timeout: Duration,
    ) -> Result<CanFrame> {
        self.drain();
        self.send(command, frame)?;
        self.receive(command, expected, timeout)
    }

    /// Discards every queued frame, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let mut stale = 0;
        while let Some(frame) = self.inbox.pop() {
            debug!("discarding stale {frame:?}");
            stale += 1;
        }
        stale
    }

    pub fn into_transmitter(self) -> T {
        self.tx
    }
}

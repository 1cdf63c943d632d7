//! Receive thread moving frames from the adapter into the inbound queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::can::{CanFrame, Receiver};
use crate::queue::Producer;

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const ERROR_SLEEP: Duration = Duration::from_millis(10);

pub struct Pump<R> {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<R>>,
}

impl<R> Pump<R>
where
    R: Receiver + Send + 'static,
    R::Error: fmt::Debug,
{
    /// Starts draining `rx` into `queue` on a new thread.
    pub fn spawn<const N: usize>(rx: R, queue: Producer<CanFrame, N>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = thread::Builder::new()
            .name("can-rx".into())
            .spawn({
                let running = running.clone();
                move || run(rx, queue, &running)
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl<R> Pump<R> {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the thread and hands back the receiver.
    ///
    /// Returns `None` if the thread panicked.
    pub fn stop(mut self) -> Option<R> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<R> {
        self.running.store(false, Ordering::Relaxed);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(rx) => Some(rx),
            Err(_) => {
                warn!("receive thread panicked");
                None
            }
        }
    }
}

impl<R> Drop for Pump<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<R, const N: usize>(mut rx: R, mut queue: Producer<CanFrame, N>, running: &AtomicBool) -> R
where
    R: Receiver,
    R::Error: fmt::Debug,
{
    debug!("receive thread started");
    while running.load(Ordering::Relaxed) {
        if rx.pending() == 0 {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let frame = match rx.receive() {
            Ok(frame) => frame,
            Err(nb::Error::WouldBlock) => continue,
            Err(nb::Error::Other(e)) => {
                warn!("receive failed: {e:?}");
                thread::sleep(ERROR_SLEEP);
                continue;
            }
        };
        trace!("rx {frame:?}");

        let mut frame = frame;
        let mut full = false;
        while let Err(rejected) = queue.push(frame) {
            if !running.load(Ordering::Relaxed) {
                debug!("queue full at shutdown, dropping {rejected:?}");
                break;
            }
            if !full {
                warn!("queue full, waiting for the executor");
                full = true;
            }
            frame = rejected;
            thread::yield_now();
        }
    }
    debug!("receive thread stopped");
    rx
}

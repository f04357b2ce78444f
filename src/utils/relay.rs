//! Controller-side stream relay
//!
//! Pumps bytes from one endpoint to another on a named thread, e.g. from a
//! child's stdout pipe to the controller's console. The monitor side can stop
//! a relay that is stuck in a blocking read.
use crate::config::types::{PipeError, PipeMode, Result};
use crate::kernel::signal::{cancel_blocking_io, IoThread};
use crate::pipe::SystemPipe;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bytes moved per read
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Spacing between cancellation attempts while stopping a relay
const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(10);

fn pump(source: &SystemPipe, sink: &SystemPipe, stop: &AtomicBool) -> Result<u64> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    'relay: while !stop.load(Ordering::SeqCst) {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }

        let mut chunk = &buf[..n];
        while !chunk.is_empty() {
            let written = sink.write(chunk)?;
            if written == 0 {
                // Sink is gone or the write was cancelled
                break 'relay;
            }
            total += written as u64;
            chunk = &chunk[written..];
        }
    }

    Ok(total)
}

/// A running relay between two endpoints
pub struct Relay {
    name: String,
    handle: JoinHandle<Result<u64>>,
    stop: Arc<AtomicBool>,
}

impl Relay {
    /// Start relaying `source` into `sink`.
    ///
    /// When the relay ends, for whatever reason, it closes the read side of
    /// `source` and the write side of `sink` so the far ends see EOF.
    pub fn spawn(name: &str, source: Arc<SystemPipe>, sink: Arc<SystemPipe>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let relay_stop = Arc::clone(&stop);
        let relay_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("relay-{}", name))
            .spawn(move || -> Result<u64> {
                let moved = pump(&source, &sink, &relay_stop);
                let closed_source = source.close_side(PipeMode::Read);
                let closed_sink = sink.close_side(PipeMode::Write);
                debug!("Relay {} finished: {:?}", relay_name, moved);
                let total = moved?;
                closed_source?;
                closed_sink?;
                Ok(total)
            })
            .map_err(|e| PipeError::Worker(format!("failed to spawn relay {}: {}", name, e)))?;

        Ok(Relay {
            name: name.to_string(),
            handle,
            stop,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the relay to end on its own (source EOF or sink gone)
    pub fn join(self) -> Result<u64> {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(PipeError::Worker(format!("relay {} panicked", self.name))),
        }
    }

    /// Stop the relay even if it is blocked in a read or write.
    ///
    /// The cancel signal can land between two syscalls, so keep knocking
    /// until the thread is out.
    pub fn stop(self) -> Result<u64> {
        while !self.handle.is_finished() {
            cancel_blocking_io(IoThread::of(&self.handle), &self.stop)?;
            thread::sleep(STOP_RETRY_INTERVAL);
        }
        debug!("Relay {} stopped", self.name);
        self.join()
    }

    /// Give the relay `grace` to drain on its own, then stop it
    pub fn finish(self, grace: Duration) -> Result<u64> {
        let deadline = Instant::now() + grace;
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(STOP_RETRY_INTERVAL);
        }

        if self.handle.is_finished() {
            self.join()
        } else {
            self.stop()
        }
    }
}

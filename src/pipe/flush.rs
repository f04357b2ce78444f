//! Background flush worker
//!
//! The flush primitive is the one call that can hang (a FIFO whose reader never
//! drains it), so it runs on a dedicated thread that close can interrupt and join.
use crate::config::types::{PipeError, Result};
use crate::kernel::signal::{cancel_blocking_io, install_cancel_handler, IoThread};
use crossbeam_channel::{Receiver, Sender};
use log::debug;
use nix::errno::Errno;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Upper bound on how long a FIFO drain waits before re-checking the stop flag
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

/// How "flushed" is decided for the output descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushTarget {
    /// Flushed once the reader has consumed every queued byte
    Fifo,
    /// Flushed once the kernel has committed the data (`fsync`)
    Storage,
}

impl FlushTarget {
    fn probe(output: &File) -> Result<Self> {
        let file_type = output.metadata().map_err(PipeError::Flush)?.file_type();
        if file_type.is_fifo() {
            Ok(FlushTarget::Fifo)
        } else {
            Ok(FlushTarget::Storage)
        }
    }
}

/// Bytes written to the pipe that the peer has not read yet
fn unread_bytes(output: &File) -> std::result::Result<usize, Errno> {
    let mut pending: libc::c_int = 0;
    // SAFETY: `output` is an open descriptor and `pending` outlives the call.
    unsafe { fionread(output.as_raw_fd(), &mut pending) }?;
    Ok(pending.max(0) as usize)
}

/// Flush-to-durable-storage on `output`.
///
/// Interruption by the cancel signal and descriptors that cannot be synced
/// (ttys, sockets, special files) both count as done.
fn sync_output(output: &File, target: FlushTarget, stop: &AtomicBool) -> Result<()> {
    match target {
        FlushTarget::Fifo => loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match unread_bytes(output) {
                Ok(0) => return Ok(()),
                Ok(_) => thread::sleep(DRAIN_POLL_INTERVAL),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(PipeError::Flush(io::Error::from(e))),
            }
        },
        FlushTarget::Storage => match output.sync_all() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::EROFS)) => Ok(()),
            Err(e) => Err(PipeError::Flush(e)),
        },
    }
}

fn run(output: File, requests: Receiver<()>, stop: Arc<AtomicBool>) -> Result<()> {
    let target = FlushTarget::probe(&output)?;
    debug!("Flush worker started ({:?})", target);

    // `output` is a private duplicate; the endpoint releases its own handle
    // only after this thread has been joined.
    while requests.recv().is_ok() {
        // Requests queued while we were asleep are served by the same flush.
        requests.try_iter().for_each(drop);

        sync_output(&output, target, &stop)?;

        if stop.load(Ordering::SeqCst) {
            break;
        }
    }

    debug!("Flush worker stopped");
    Ok(())
}

/// Dedicated flush thread of one writable endpoint
#[derive(Debug)]
pub(crate) struct FlushWorker {
    handle: JoinHandle<Result<()>>,
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl FlushWorker {
    /// Start a worker for `output`. Returns the worker and the sender callers
    /// use to post flush requests.
    pub(crate) fn spawn(output: &File) -> Result<(Self, Sender<()>)> {
        install_cancel_handler()?;

        let output = output
            .try_clone()
            .map_err(|e| PipeError::Worker(format!("failed to duplicate output handle: {}", e)))?;
        let (wake, requests) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("pipe-flush".to_string())
            .spawn(move || run(output, requests, worker_stop))
            .map_err(|e| PipeError::Worker(format!("failed to spawn flush thread: {}", e)))?;

        let requests_tx = wake.clone();
        Ok((FlushWorker { handle, stop, wake }, requests_tx))
    }

    /// Stop and join the worker.
    ///
    /// Order matters: publish stop, guarantee one more wake-up, interrupt the
    /// in-flight flush, then join.
    pub(crate) fn shutdown(self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wake.send(());
        let cancelled = cancel_blocking_io(IoThread::of(&self.handle), &self.stop);

        let joined = match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(PipeError::Worker("flush thread panicked".to_string())),
        };

        cancelled.and(joined)
    }
}

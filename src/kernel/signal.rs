//! Thread-directed interruption of blocking syscalls
//!
//! A dedicated signal is installed once with a no-op handler and without
//! `SA_RESTART`. Delivering it to one thread with `pthread_kill` makes the
//! syscall that thread is blocked in return `EINTR`, which the pipe layer
//! treats as an aborted (benign) transfer.
use crate::config::types::{PipeError, Result};
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::marker::PhantomData;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::JoinHandle;

/// Signal used to knock a thread out of a blocking call.
/// Its default disposition is "ignore", so a stray delivery is harmless.
pub const CANCEL_SIGNAL: Signal = Signal::SIGURG;

/// Outcome of the one-time handler installation
static CANCEL_HANDLER: OnceLock<std::result::Result<(), Errno>> = OnceLock::new();

/// Async-safe handler: its only job is to exist so the syscall is interrupted
extern "C" fn interrupt_handler(_signal: libc::c_int) {}

/// Install the cancellation handler for the whole process (idempotent).
///
/// Must run before a cancellation is requested; an ignored signal does not
/// interrupt anything.
pub fn install_cancel_handler() -> Result<()> {
    let outcome = *CANCEL_HANDLER.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::Handler(interrupt_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );

        // SAFETY: the handler performs no work at all, so it is async-signal-safe.
        let installed = unsafe { signal::sigaction(CANCEL_SIGNAL, &action) }.map(|_| ());
        if installed.is_ok() {
            info!("I/O cancellation handler installed ({})", CANCEL_SIGNAL);
        }
        installed
    });

    outcome.map_err(PipeError::Cancel)
}

/// Identity of a thread that may be blocked in native I/O.
///
/// A `pthread_t` can be recycled once its thread is joined, so an `IoThread`
/// borrows the `JoinHandle` it came from and cannot outlive the join. One
/// taken with [`IoThread::current`] cannot leave the calling thread.
///
/// ```compile_fail
/// use std::sync::atomic::AtomicBool;
///
/// let handle = std::thread::spawn(|| {});
/// let thread = pipebox::IoThread::of(&handle);
/// handle.join().unwrap();
/// let _ = pipebox::cancel_blocking_io(thread, &AtomicBool::new(false));
/// ```
#[derive(Debug, PartialEq, Eq)]
pub struct IoThread<'a> {
    id: Pthread,
    handle: PhantomData<&'a *const ()>,
}

impl IoThread<'static> {
    /// The calling thread
    pub fn current() -> Self {
        IoThread {
            id: pthread_self(),
            handle: PhantomData,
        }
    }
}

impl<'a> IoThread<'a> {
    /// The thread behind a join handle that has not been joined yet
    pub fn of<T>(handle: &'a JoinHandle<T>) -> Self {
        IoThread {
            id: handle.as_pthread_t(),
            handle: PhantomData,
        }
    }
}

/// Ask `thread` to stop: raise `stop`, then interrupt at most one in-flight
/// blocking call on that thread.
///
/// A thread that has already exited counts as "nothing to cancel". The target
/// must re-check `stop` after every syscall; a signal that lands between two
/// calls is lost.
pub fn cancel_blocking_io(thread: IoThread<'_>, stop: &AtomicBool) -> Result<()> {
    stop.store(true, Ordering::SeqCst);
    install_cancel_handler()?;

    match pthread_kill(thread.id, CANCEL_SIGNAL) {
        Ok(()) => {
            debug!("Sent {} to thread {:?}", CANCEL_SIGNAL, thread);
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!("Thread {:?} already gone, nothing to cancel", thread);
            Ok(())
        }
        Err(e) => Err(PipeError::Cancel(e)),
    }
}

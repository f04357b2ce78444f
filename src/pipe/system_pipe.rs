//! Synchronized pipe endpoint
//!
//! Owns up to two native stream handles plus the flush worker of the write
//! side. Reads, writes, flushes and closes may come from any number of threads.
use crate::config::types::{PipeError, PipeKind, PipeMode, Result, StdStream};
use crate::pipe::flush::FlushWorker;
use crossbeam_channel::Sender;
use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Sentinel for a side that holds no handle
const NO_HANDLE: RawFd = -1;

/// One direction of an endpoint: the handle behind its own lock.
///
/// `raw` mirrors the handle so state queries never wait behind a blocked
/// read or write. It only changes while `handle` is locked.
struct Side {
    handle: Mutex<Option<File>>,
    raw: AtomicI32,
}

impl Side {
    fn new(file: Option<File>) -> Self {
        let raw = file.as_ref().map_or(NO_HANDLE, |f| f.as_raw_fd());
        Side {
            handle: Mutex::new(file),
            raw: AtomicI32::new(raw),
        }
    }

    /// The guarded handle only ever moves from `Some` to `None`, so a
    /// poisoned lock still holds a consistent value.
    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self) -> bool {
        self.raw.load(Ordering::SeqCst) != NO_HANDLE
    }

    fn raw(&self) -> Option<RawFd> {
        match self.raw.load(Ordering::SeqCst) {
            NO_HANDLE => None,
            fd => Some(fd),
        }
    }

    /// Release the handle. Returns false if it was already gone.
    fn release(&self) -> bool {
        let mut guard = self.lock();
        match guard.take() {
            Some(file) => {
                self.raw.store(NO_HANDLE, Ordering::SeqCst);
                drop(file);
                true
            }
            None => false,
        }
    }
}

/// Errors that mean "the other side of the stream is gone" or "this call was
/// cancelled on purpose". EPIPE covers a vanished reader, ECONNRESET a
/// vanished socket peer, EINTR the cancel signal.
fn is_stream_end(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

/// Take an advisory lock that mirrors share modes: exclusive opens conflict
/// with every other opener of the path, shared opens only with exclusive ones.
fn lock_for_sharing(file: &File, path: &Path, exclusive: bool) -> Result<()> {
    let operation = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };

    // SAFETY: flock only inspects the descriptor, which `file` keeps open.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Err(PipeError::Locked {
            path: path.to_path_buf(),
        })
    } else {
        Err(PipeError::Open {
            path: path.to_path_buf(),
            source: err,
        })
    }
}

fn duplicate(fd: BorrowedFd<'_>, what: &str) -> Result<File> {
    fd.try_clone_to_owned()
        .map(File::from)
        .map_err(|source| PipeError::Duplicate {
            handle: what.to_string(),
            source,
        })
}

/// Synchronized endpoint over a pipe pair, a file or a standard stream
pub struct SystemPipe {
    kind: PipeKind,
    autoflush: bool,
    input: Side,
    output: Side,
    /// Flush-request signal; `None` when the endpoint has no flush worker
    flush_requests: Option<Sender<()>>,
    /// Close lock. Also owns the flush worker, so teardown only happens under it.
    closing: Mutex<Option<FlushWorker>>,
}

impl SystemPipe {
    fn assemble(
        kind: PipeKind,
        autoflush: bool,
        input: Option<File>,
        output: Option<File>,
        with_flush_worker: bool,
    ) -> Result<Self> {
        let (worker, flush_requests) = match output.as_ref() {
            Some(file) if with_flush_worker => {
                let (worker, requests) = FlushWorker::spawn(file)?;
                (Some(worker), Some(requests))
            }
            _ => (None, None),
        };

        let pipe = SystemPipe {
            kind,
            autoflush,
            input: Side::new(input),
            output: Side::new(output),
            flush_requests,
            closing: Mutex::new(worker),
        };
        debug!("Opened {:?}", pipe);
        Ok(pipe)
    }

    /// Bind to one of the controller's own standard streams.
    ///
    /// The endpoint owns a close-on-exec duplicate, so closing it leaves the
    /// controller's console untouched.
    pub fn open_std(stream: StdStream, autoflush: bool) -> Result<Self> {
        match stream {
            StdStream::Input => {
                let input = duplicate(io::stdin().as_fd(), stream.name())?;
                Self::assemble(PipeKind::Console, autoflush, Some(input), None, false)
            }
            StdStream::Output => {
                let output = duplicate(io::stdout().as_fd(), stream.name())?;
                Self::assemble(PipeKind::Console, autoflush, None, Some(output), true)
            }
            StdStream::Error => {
                let output = duplicate(io::stderr().as_fd(), stream.name())?;
                Self::assemble(PipeKind::Console, autoflush, None, Some(output), true)
            }
        }
    }

    /// Create a connected anonymous pipe pair.
    ///
    /// Both ends start inheritable; the end the controller keeps (the input
    /// side in read mode, the output side in write mode) is made
    /// close-on-exec so only the child's end crosses `exec`.
    pub fn create_pipe(mode: PipeMode, autoflush: bool) -> Result<Self> {
        let (read_end, write_end) = nix::unistd::pipe().map_err(PipeError::Create)?;

        let retained = match mode {
            PipeMode::Read => read_end.as_raw_fd(),
            PipeMode::Write => write_end.as_raw_fd(),
        };
        fcntl(retained, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PipeError::Inheritance)?;

        Self::assemble(
            PipeKind::Pipe,
            autoflush,
            Some(File::from(read_end)),
            Some(File::from(write_end)),
            mode == PipeMode::Write,
        )
    }

    /// Open a file: read mode opens an existing file, write mode creates or
    /// truncates one. `exclusive` refuses to share the path with any other
    /// opener while this endpoint holds it.
    pub fn open_file<P: AsRef<Path>>(
        path: P,
        mode: PipeMode,
        autoflush: bool,
        exclusive: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let open_error = |source: io::Error| PipeError::Open {
            path: PathBuf::from(path),
            source,
        };

        let mut options = OpenOptions::new();
        match mode {
            PipeMode::Read => options.read(true),
            PipeMode::Write => options.write(true).create(true),
        };
        let file = options.open(path).map_err(open_error)?;

        // Truncate only once the lock is ours so a refused opener cannot
        // wipe the holder's output.
        lock_for_sharing(&file, path, exclusive)?;

        match mode {
            PipeMode::Read => Self::assemble(PipeKind::File, autoflush, Some(file), None, false),
            PipeMode::Write => {
                // Devices and FIFOs have no length to reset.
                if file.metadata().map_err(open_error)?.file_type().is_file() {
                    file.set_len(0).map_err(open_error)?;
                }
                Self::assemble(PipeKind::File, autoflush, None, Some(file), true)
            }
        }
    }

    /// Read up to `buf.len()` bytes. Returns 0 when the side is closed, the
    /// peer is gone or the call was cancelled.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.input.lock();
        let Some(mut file) = guard.as_ref() else {
            return Ok(0);
        };

        match file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_stream_end(&e) => {
                debug!("Read on {} endpoint ended: {}", self.kind, e);
                Ok(0)
            }
            Err(e) => Err(PipeError::Read(e)),
        }
    }

    /// Write up to `buf.len()` bytes in one native call. Returns 0 when the
    /// side is closed or the reader is gone. Never waits for the flush.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let written = {
            let guard = self.output.lock();
            let Some(mut file) = guard.as_ref() else {
                return Ok(0);
            };

            match file.write(buf) {
                Ok(n) => n,
                Err(e) if is_stream_end(&e) => {
                    debug!("Write on {} endpoint ended: {}", self.kind, e);
                    0
                }
                Err(e) => return Err(PipeError::Write(e)),
            }
        };

        if written > 0 && self.autoflush {
            self.flush();
        }
        Ok(written)
    }

    /// Post a flush request to the worker and return immediately.
    pub fn flush(&self) {
        if let Some(requests) = &self.flush_requests {
            // Fails only once the worker is gone, i.e. the side is closing.
            let _ = requests.send(());
        }
    }

    /// Close one side. Idempotent.
    ///
    /// For the write side the flush worker is stopped and joined before the
    /// handle is released. An error raised by the worker is returned here.
    pub fn close_side(&self, mode: PipeMode) -> Result<()> {
        let mut worker = self.closing.lock().unwrap_or_else(PoisonError::into_inner);

        match mode {
            PipeMode::Read => {
                if self.input.release() {
                    debug!("Closed input side of {} endpoint", self.kind);
                }
                Ok(())
            }
            PipeMode::Write => {
                let stopped = match worker.take() {
                    Some(flusher) => flusher.shutdown(),
                    None => Ok(()),
                };
                if self.output.release() {
                    debug!("Closed output side of {} endpoint", self.kind);
                }
                stopped
            }
        }
    }

    /// Close both sides. Safe to call any number of times.
    pub fn close(&self) -> Result<()> {
        let read = self.close_side(PipeMode::Read);
        let write = self.close_side(PipeMode::Write);
        read.and(write)
    }

    pub fn is_readable(&self) -> bool {
        self.input.is_open()
    }

    pub fn is_writable(&self) -> bool {
        self.output.is_open()
    }

    pub fn is_file(&self) -> bool {
        self.kind == PipeKind::File
    }

    pub fn is_console(&self) -> bool {
        self.kind == PipeKind::Console
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    pub fn autoflush(&self) -> bool {
        self.autoflush
    }

    /// Raw input handle, for wiring into a child's standard slot
    pub fn get_input_handle(&self) -> Option<RawFd> {
        self.input.raw()
    }

    /// Raw output handle, for wiring into a child's standard slot
    pub fn get_output_handle(&self) -> Option<RawFd> {
        self.output.raw()
    }

    /// Owned close-on-exec duplicate of one side's handle, e.g. for
    /// `std::process::Stdio::from`. Waits behind an in-flight transfer on
    /// that side.
    pub fn duplicate_handle(&self, mode: PipeMode) -> Result<Option<OwnedFd>> {
        let (side, what) = match mode {
            PipeMode::Read => (&self.input, "input"),
            PipeMode::Write => (&self.output, "output"),
        };
        let guard = side.lock();
        match guard.as_ref() {
            Some(file) => duplicate(file.as_fd(), what).map(|f| Some(OwnedFd::from(f))),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for SystemPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemPipe")
            .field("kind", &self.kind)
            .field("autoflush", &self.autoflush)
            .field("input", &self.input.raw())
            .field("output", &self.output.raw())
            .field("flush_worker", &self.flush_requests.is_some())
            .finish()
    }
}

impl Drop for SystemPipe {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {} endpoint cleanly: {}", self.kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn cloexec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_read_mode_pipe_inheritance() {
        let pipe = SystemPipe::create_pipe(PipeMode::Read, false).unwrap();
        assert!(cloexec(pipe.get_input_handle().unwrap()));
        assert!(!cloexec(pipe.get_output_handle().unwrap()));
        assert!(pipe.flush_requests.is_none());
    }

    #[test]
    fn test_write_mode_pipe_inheritance() {
        let pipe = SystemPipe::create_pipe(PipeMode::Write, false).unwrap();
        assert!(!cloexec(pipe.get_input_handle().unwrap()));
        assert!(cloexec(pipe.get_output_handle().unwrap()));
        assert!(pipe.flush_requests.is_some());
    }

    #[test]
    fn test_pipe_round_trip() {
        let pipe = SystemPipe::create_pipe(PipeMode::Read, false).unwrap();
        assert!(pipe.is_readable() && pipe.is_writable());
        assert_eq!(pipe.kind(), PipeKind::Pipe);
        assert!(!pipe.is_file() && !pipe.is_console());

        assert_eq!(pipe.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_close_is_idempotent() {
        let pipe = SystemPipe::create_pipe(PipeMode::Write, true).unwrap();
        pipe.close().unwrap();
        pipe.close().unwrap();
        pipe.close_side(PipeMode::Write).unwrap();
        assert!(!pipe.is_readable());
        assert!(!pipe.is_writable());
        assert_eq!(pipe.get_input_handle(), None);
        assert_eq!(pipe.get_output_handle(), None);
    }

    #[test]
    fn test_closed_sides_transfer_nothing() {
        let pipe = SystemPipe::create_pipe(PipeMode::Read, false).unwrap();
        pipe.close().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(pipe.read(&mut buf).unwrap(), 0);
        assert_eq!(pipe.write(b"data").unwrap(), 0);
        pipe.flush();
    }

    #[test]
    fn test_read_after_peer_closed() {
        let pipe = SystemPipe::create_pipe(PipeMode::Read, false).unwrap();
        pipe.write(b"tail").unwrap();
        pipe.close_side(PipeMode::Write).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(pipe.read(&mut buf).unwrap(), 4);
        assert_eq!(pipe.read(&mut buf).unwrap(), 0);
        assert!(pipe.is_readable());
    }

    #[test]
    fn test_write_after_peer_closed() {
        let pipe = SystemPipe::create_pipe(PipeMode::Write, true).unwrap();
        pipe.close_side(PipeMode::Read).unwrap();
        assert_eq!(pipe.write(b"nobody listens").unwrap(), 0);
        assert!(pipe.is_writable());
    }

    #[test]
    fn test_close_write_side_with_unread_data() {
        let pipe = SystemPipe::create_pipe(PipeMode::Write, true).unwrap();
        assert_eq!(pipe.write(&[0x5a; 100]).unwrap(), 100);

        let start = Instant::now();
        pipe.close_side(PipeMode::Write).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!pipe.is_writable());
        assert!(pipe.is_readable());
    }

    #[test]
    fn test_read_only_file_has_no_worker() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"contents").unwrap();

        let pipe = SystemPipe::open_file(file.path(), PipeMode::Read, true, false).unwrap();
        assert!(pipe.is_file());
        assert!(pipe.is_readable() && !pipe.is_writable());
        assert!(pipe.flush_requests.is_none());

        let mut buf = [0u8; 32];
        assert_eq!(pipe.read(&mut buf).unwrap(), 8);
        assert_eq!(pipe.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_file_truncates() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"stale stale stale").unwrap();

        let pipe = SystemPipe::open_file(file.path(), PipeMode::Write, true, false).unwrap();
        assert_eq!(pipe.write(b"fresh").unwrap(), 5);
        pipe.close().unwrap();

        assert_eq!(std::fs::read(file.path()).unwrap(), b"fresh");
    }

    #[test]
    fn test_write_mode_on_device() {
        let pipe = SystemPipe::open_file("/dev/null", PipeMode::Write, true, false).unwrap();
        assert!(pipe.is_file() && pipe.is_writable());
        assert_eq!(pipe.write(b"discarded").unwrap(), 9);
        pipe.close().unwrap();
    }

    #[test]
    fn test_write_mode_on_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.fifo");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRWXU).unwrap();

        // Opening a FIFO for writing waits for a reader.
        let reader_path = path.clone();
        let reader = thread::spawn(move || std::fs::read(reader_path).unwrap());

        let pipe = SystemPipe::open_file(&path, PipeMode::Write, true, true).unwrap();
        assert_eq!(pipe.write(b"through fifo").unwrap(), 12);
        pipe.close().unwrap();
        assert_eq!(reader.join().unwrap(), b"through fifo");
    }

    fn queued_requests(pipe: &SystemPipe) -> usize {
        pipe.flush_requests.as_ref().unwrap().len()
    }

    /// Park the flush worker in a drain nobody completes, so later requests
    /// stay in the queue.
    fn stall_worker(pipe: &SystemPipe) {
        assert_eq!(pipe.write(b"unread").unwrap(), 6);
        if !pipe.autoflush() {
            pipe.flush();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while queued_requests(pipe) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queued_requests(pipe), 0);
        thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn test_autoflush_queues_request_per_write() {
        let pipe = SystemPipe::create_pipe(PipeMode::Write, true).unwrap();
        stall_worker(&pipe);

        assert_eq!(pipe.write(b"more").unwrap(), 4);
        assert_eq!(queued_requests(&pipe), 1);

        // Nothing written, nothing to flush.
        assert_eq!(pipe.write(b"").unwrap(), 0);
        assert_eq!(queued_requests(&pipe), 1);

        pipe.flush();
        assert_eq!(queued_requests(&pipe), 2);
        pipe.close().unwrap();
    }

    #[test]
    fn test_write_without_autoflush_queues_nothing() {
        let pipe = SystemPipe::create_pipe(PipeMode::Write, false).unwrap();
        stall_worker(&pipe);

        assert_eq!(pipe.write(b"quiet").unwrap(), 5);
        assert_eq!(queued_requests(&pipe), 0);

        pipe.flush();
        assert_eq!(queued_requests(&pipe), 1);
        pipe.close().unwrap();
    }

    #[test]
    fn test_open_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        let err = SystemPipe::open_file(&missing, PipeMode::Read, false, false).unwrap_err();
        match err {
            PipeError::Open { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_exclusive_open_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let first = SystemPipe::open_file(&path, PipeMode::Write, false, true).unwrap();
        first.write(b"kept").unwrap();

        let second = SystemPipe::open_file(&path, PipeMode::Write, false, true);
        assert!(matches!(second, Err(PipeError::Locked { .. })));
        let shared = SystemPipe::open_file(&path, PipeMode::Read, false, false);
        assert!(matches!(shared, Err(PipeError::Locked { .. })));

        first.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
        assert!(SystemPipe::open_file(&path, PipeMode::Read, false, true).is_ok());
    }

    #[test]
    fn test_shared_opens_coexist() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let a = SystemPipe::open_file(file.path(), PipeMode::Read, false, false).unwrap();
        let b = SystemPipe::open_file(file.path(), PipeMode::Read, false, false).unwrap();
        assert!(a.is_readable() && b.is_readable());
    }

    #[test]
    fn test_std_endpoints() {
        let input = SystemPipe::open_std(StdStream::Input, false).unwrap();
        assert!(input.is_console());
        assert!(input.is_readable() && !input.is_writable());
        assert!(input.flush_requests.is_none());

        let error = SystemPipe::open_std(StdStream::Error, true).unwrap();
        assert!(error.is_writable() && !error.is_readable());
        assert!(error.flush_requests.is_some());
        error.close().unwrap();

        // The controller's own stderr is still usable.
        assert!(std::io::stderr().write_all(b"").is_ok());
    }

    #[test]
    fn test_duplicate_handle() {
        let pipe = SystemPipe::create_pipe(PipeMode::Read, false).unwrap();
        let dup = pipe.duplicate_handle(PipeMode::Write).unwrap().unwrap();
        assert!(cloexec(dup.as_raw_fd()));

        let mut writer = File::from(dup);
        writer.write_all(b"via dup").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf).unwrap(), 7);

        pipe.close_side(PipeMode::Write).unwrap();
        assert!(pipe.duplicate_handle(PipeMode::Write).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_close() {
        let pipe = Arc::new(SystemPipe::create_pipe(PipeMode::Write, true).unwrap());
        assert_eq!(pipe.write(b"pending").unwrap(), 7);

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let pipe = Arc::clone(&pipe);
                thread::spawn(move || pipe.close())
            })
            .collect();
        for closer in closers {
            closer.join().unwrap().unwrap();
        }
        assert!(!pipe.is_readable() && !pipe.is_writable());
    }
}

//! Synchronized pipe endpoints
//!
//! [`SystemPipe`] wraps pipe ends, files and the controller's standard streams
//! so they can be read, written, flushed and closed from several threads.
//! The `flush` module holds the per-endpoint flush worker.

pub(crate) mod flush;
pub mod system_pipe;

pub use flush::DRAIN_POLL_INTERVAL;
pub use system_pipe::SystemPipe;

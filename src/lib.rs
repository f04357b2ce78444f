//! pipebox: stdio redirection layer for sandboxed child processes
//!
//! A sandbox controller wires a child's standard streams to anonymous pipes,
//! files or its own console, then reads, writes and tears them down from
//! several threads at once, including monitor threads that must be able to
//! unblock a stuck transfer.
//!
//! # Architecture
//!
//! ## Pipe endpoints ([`pipe`])
//! - [`pipe::SystemPipe`]: synchronized endpoint over up to two native handles,
//!   with per-direction locks, a close lock and a per-endpoint flush worker
//!
//! ## Kernel primitives ([`kernel`])
//! - [`kernel::signal`]: thread-directed interruption of blocking syscalls
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: endpoint vocabulary and the fatal error taxonomy
//! - [`config::redirect`]: per-slot redirect specs and their endpoints
//!
//! ## Utilities ([`utils`])
//! - [`utils::relay`]: controller-side pumping between two endpoints
//!
//! # Error model
//!
//! A peer that went away, or a call cancelled on purpose, ends a transfer with
//! zero bytes. Every other OS failure is a [`PipeError`] that the top-level
//! runner ([`cli`]) logs before exiting.

// Pipe endpoints
pub mod pipe;

// Kernel primitives
pub mod kernel;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI runner
pub mod cli;

pub use config::types::*;
pub use kernel::signal::{cancel_blocking_io, IoThread};
pub use pipe::SystemPipe;

//! Thin wrappers around Linux kernel primitives.
//!
//! All signal-level `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod signal;

pub use signal::{cancel_blocking_io, install_cancel_handler, IoThread, CANCEL_SIGNAL};

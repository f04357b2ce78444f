//! Utilities
//!
//! Controller-side plumbing built on top of pipe endpoints.

pub mod relay;

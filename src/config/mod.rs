//! Configuration and shared types
//!
//! Endpoint vocabulary, the error taxonomy and redirect wiring for child slots.

pub mod redirect;
pub mod types;

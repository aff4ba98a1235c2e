//! Operational plumbing.
//!
//! - `telemetry` - Structured logging setup, runtime log level, log throttling

pub mod telemetry;

pub use telemetry::*;

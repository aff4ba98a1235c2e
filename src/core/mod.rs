//! Core runtime infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `runtime` - Task wiring, operator console and shutdown
//! - `time` - Clock abstraction

pub mod config;
pub mod runtime;
pub mod time;

pub use config::*;
pub use runtime::*;
pub use time::*;

//! CLI command implementations.

mod collect;
mod report;
mod simulate;
mod start;

pub use collect::run_collect;
pub use report::run_report;
pub use simulate::run_simulate;
pub use start::run_start;

//! Command-line interface.

pub mod args;
pub mod batch;

pub use args::{Args, Command};
pub use batch::{load_batch_jobs, parse_batch, BatchEntry};

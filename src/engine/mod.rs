// Module: Engine
// The host side of the system: shared run configuration, the subprocess
// executor, and the batch scheduler.

pub mod config;
pub mod executor;
pub mod scheduler;

pub use config::RunConfig;
pub use executor::{RunOptions, SubprocessExecutor, TestRunner};
pub use scheduler::{run_many, BatchOptions};

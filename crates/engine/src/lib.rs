//! Compiles stream configurations into engine invocations and supervises the
//! resulting engine process.

pub mod builder;
pub mod command;
pub mod config;
pub mod monitor;
pub mod status;
pub mod store;
pub mod supervisor;
mod task;

pub use builder::{build, ConfigError};
pub use command::*;
pub use config::*;
pub use monitor::ExitOutcome;
pub use status::{StatusReport, StatusReporter};
pub use store::{ConfigStore, JsonConfigStore, MemoryConfigStore, StoreError};
pub use supervisor::*;
pub use task::*;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{RunConfig, SyncPath};
pub use crate::core::{ExitClass, RunResult, SyncEngine, TaskObserver, TaskOutcome};
pub use crate::error::{SyncError, SyncResult};

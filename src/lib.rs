//! Grid Connection Watcher
//!
//! Reads grid telemetry from Module-M and Modbus meters over USB/RS485
//! serial links, buffers every sample durably and uploads batches to a
//! remote sink. A watchdog restarts stalled links, and a separate
//! updater flashes UF2 firmware onto Module-M.

pub mod cli;
pub mod config;
pub mod devices;
pub mod events;
pub mod firmware;
pub mod link;
pub mod modbus;
pub mod output;
pub mod services;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use firmware::{FirmwareJob, FirmwareUpdater};
pub use services::GridWatcher;
pub use storage::{Sample, SampleBuffer};
pub use utils::error::{WatcherError, WatcherResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

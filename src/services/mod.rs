pub mod acquisition;
pub mod lease;
pub mod uploader;
pub mod watchdog;
pub mod watcher;

pub use acquisition::AcquisitionUnit;
pub use lease::{LeaseGuard, LinkLease};
pub use uploader::{BacklogLevel, UploadStep, Uploader};
pub use watchdog::{AlertSeverity, UnitState, Watchdog, WatchdogAction, WatchdogInput};
pub use watcher::GridWatcher;

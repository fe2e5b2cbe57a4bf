pub mod debug;
pub mod job;
pub mod source;
pub mod target;
pub mod uf2;
pub mod updater;

pub use debug::{DebugCommand, DebugSession};
pub use job::{FirmwareJob, UpdateState};
pub use source::{HttpImageSource, ImageSource};
pub use target::{FirmwareTarget, UsbUf2Target};
pub use updater::{exit_code, FirmwareUpdater};

pub mod module_m;
pub mod traits;

pub use module_m::{ModuleMDecoder, ModuleMFrame, ModuleMReader};
pub use traits::{FailureTracker, PollOutcome, TelemetryReader};

use crate::config::{LinkConfig, ReaderConfig};
use crate::modbus::ModbusReader;

/// Builds the reader that matches a link's configured device.
pub fn build_reader(link: &LinkConfig) -> Box<dyn TelemetryReader> {
    match &link.reader {
        ReaderConfig::ModuleM(config) => Box::new(ModuleMReader::new(&link.name, config.clone())),
        ReaderConfig::Modbus(config) => Box::new(ModbusReader::new(&link.name, config.clone())),
    }
}

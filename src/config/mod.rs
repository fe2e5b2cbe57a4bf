pub mod config_commands;
pub mod settings;

pub use config_commands::handle_config_commands;
pub use settings::{
    BufferConfig,
    Config,
    DataType,
    FileSinkConfig,
    FirmwareConfig,
    HttpSinkConfig,
    LinkConfig,
    ModbusConfig,
    ModuleMConfig,
    ParityConfig,
    ReaderConfig,
    RegisterConfig,
    RegisterKind,
    SinkConfig,
    UploaderConfig,
    WatchdogConfig,
    MODULE_M_PID,
    MODULE_M_VID,
};

use clap::ArgMatches;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::backoff::RetryPolicy;
use crate::utils::error::{WatcherError, WatcherResult};

/// USB identifiers Module-M enumerates with in telemetry mode.
pub const MODULE_M_VID: u16 = 0x239A;
pub const MODULE_M_PID: u16 = 0x80A4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Watcher identification. Empty means the id stored in the sample
    // buffer, minted once on first start.
    pub watcher_id: String,
    pub watcher_name: String,

    /// Restart-storm damping: the service sleeps this long before touching
    /// any device.
    pub startup_delay_seconds: u64,

    pub links: Vec<LinkConfig>,
    pub buffer: BufferConfig,
    pub uploader: UploaderConfig,
    pub watchdog: WatchdogConfig,
    pub firmware: FirmwareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Source id stamped on every sample read over this link.
    pub name: String,
    /// Fixed device node. `None` or `"auto"` means discover by USB VID/PID.
    pub device_path: Option<String>,
    pub usb_vid: Option<u16>,
    pub usb_pid: Option<u16>,
    pub baud_rate: u32,
    pub parity: ParityConfig,
    pub read_timeout_ms: u64,
    pub reconnect: RetryPolicy,
    pub reader: ReaderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReaderConfig {
    ModuleM(ModuleMConfig),
    Modbus(ModbusConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleMConfig {
    pub failure_threshold: u32,
    /// How often `*A` is re-sent while the device has not confirmed.
    pub register_interval_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub slave_address: u8,
    pub register_kind: RegisterKind,
    pub poll_interval_ms: u64,
    pub response_timeout_ms: u64,
    pub failure_threshold: u32,
    pub registers: Vec<RegisterConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
}

impl RegisterKind {
    pub fn function_code(self) -> u8 {
        match self {
            RegisterKind::Holding => 0x03,
            RegisterKind::Input => 0x04,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub name: String,
    pub address: u16,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: String,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl DataType {
    pub fn word_count(self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub database_path: String,
    /// Maximum number of queued samples. Oldest are evicted beyond this.
    pub capacity: usize,
    pub batch_size: usize,
    pub busy_timeout_ms: u64,
    pub sync_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub sink: SinkConfig,
    pub retry: RetryPolicy,
    pub idle_poll_ms: u64,
    /// Backlog fraction of capacity above which delivery failures log at warn.
    pub backlog_warn_ratio: f64,
    /// Backlog fraction of capacity above which delivery failures log at error.
    pub backlog_error_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Http(HttpSinkConfig),
    File(FileSinkConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,
}

fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSinkConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub heartbeat_window_secs: u64,
    pub grace_period_secs: u64,
    pub max_failed_restarts: u32,
    pub restart_window_secs: u64,
    pub tick_ms: u64,
    /// Lock file the firmware updater holds while it owns the USB link.
    pub lease_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    pub baud_rate: u32,
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub boot_command_retries: u32,
    pub boot_command_timeout_ms: u64,
    pub boot_command_retry_delay_ms: u64,
    pub bootloader_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub drive_label: String,
    pub mount_base: String,
    pub download_path: String,
    pub download: RetryPolicy,
    pub lease_settle_ms: u64,
    pub audit_log_path: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "module_m".to_string(),
            device_path: None,
            usb_vid: Some(MODULE_M_VID),
            usb_pid: Some(MODULE_M_PID),
            baud_rate: 9600,
            parity: ParityConfig::None,
            read_timeout_ms: 100,
            reconnect: RetryPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(30)),
            reader: ReaderConfig::ModuleM(ModuleMConfig::default()),
        }
    }
}

impl Default for ModuleMConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            register_interval_ms: 2000,
            poll_interval_ms: 300,
        }
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        let f32_reg = |name: &str, address: u16, unit: &str| RegisterConfig {
            name: name.to_string(),
            address,
            data_type: DataType::F32,
            scale: 1.0,
            unit: unit.to_string(),
        };

        // Eastron SDM630-style input register map
        Self {
            slave_address: 1,
            register_kind: RegisterKind::Input,
            poll_interval_ms: 5000,
            response_timeout_ms: 1000,
            failure_threshold: 5,
            registers: vec![
                f32_reg("l1_voltage", 0x0000, "V"),
                f32_reg("l2_voltage", 0x0002, "V"),
                f32_reg("l3_voltage", 0x0004, "V"),
                f32_reg("l1_current", 0x0006, "A"),
                f32_reg("l2_current", 0x0008, "A"),
                f32_reg("l3_current", 0x000A, "A"),
                f32_reg("l1_power", 0x000C, "W"),
                f32_reg("l2_power", 0x000E, "W"),
                f32_reg("l3_power", 0x0010, "W"),
                f32_reg("frequency", 0x0046, "Hz"),
                f32_reg("energy_import", 0x0048, "kWh"),
                f32_reg("energy_export", 0x004A, "kWh"),
            ],
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            database_path: "data/sample_buffer.db".to_string(),
            // 24h of a 12-metric reading every 5 s plus Module-M frames
            capacity: 500_000,
            batch_size: 200,
            busy_timeout_ms: 30000,
            sync_mode: "FULL".to_string(),
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            sink: SinkConfig::File(FileSinkConfig {
                path: "data/uploaded.jsonl".to_string(),
            }),
            retry: RetryPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(300)),
            idle_poll_ms: 1000,
            backlog_warn_ratio: 0.25,
            backlog_error_ratio: 0.75,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_window_secs: 60,
            grace_period_secs: 30,
            max_failed_restarts: 3,
            restart_window_secs: 900,
            tick_ms: 1000,
            lease_path: "/tmp/gridconnection_watcher.fwlock".to_string(),
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            usb_vid: MODULE_M_VID,
            usb_pid: MODULE_M_PID,
            boot_command_retries: 5,
            boot_command_timeout_ms: 5000,
            boot_command_retry_delay_ms: 3000,
            bootloader_timeout_secs: 20,
            verify_timeout_secs: 20,
            drive_label: "ENERTYMBOOT".to_string(),
            mount_base: "/tmp/esp32_mount".to_string(),
            download_path: "/tmp/firmware.uf2".to_string(),
            download: RetryPolicy::bounded(3, Duration::from_secs(2), Duration::from_secs(10)),
            lease_settle_ms: 3000,
            audit_log_path: "data/firmware_audit.jsonl".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watcher_id: String::new(),
            watcher_name: "Grid Connection Watcher".to_string(),
            startup_delay_seconds: 5,
            links: vec![
                LinkConfig::default(),
                LinkConfig {
                    name: "energy_meter".to_string(),
                    device_path: Some("/dev/ttyUSB0".to_string()),
                    usb_vid: None,
                    usb_pid: None,
                    reader: ReaderConfig::Modbus(ModbusConfig::default()),
                    ..LinkConfig::default()
                },
            ],
            buffer: BufferConfig::default(),
            uploader: UploaderConfig::default(),
            watchdog: WatchdogConfig::default(),
            firmware: FirmwareConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// The fixed device path, or `None` when the port must be discovered.
    pub fn fixed_path(&self) -> Option<&str> {
        match self.device_path.as_deref() {
            None | Some("") | Some("auto") => None,
            Some(path) => Some(path),
        }
    }
}

impl WatchdogConfig {
    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_window_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> WatcherResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            WatcherError::Config(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise falls back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> WatcherResult<Self> {
        if path.as_ref().exists() {
            info!("📄 Loading configuration from {}", path.as_ref().display());
            Self::from_file(path)
        } else {
            warn!(
                "⚠️  Configuration file {} not found, using defaults",
                path.as_ref().display()
            );
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> WatcherResult<()> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| WatcherError::Config(format!("Cannot serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Command line overrides. Only options that were actually passed apply.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> WatcherResult<()> {
        if matches.try_contains_id("no-startup-delay").unwrap_or(false)
            && matches.get_flag("no-startup-delay")
        {
            self.startup_delay_seconds = 0;
        }

        if let Ok(Some(path)) = matches.try_get_one::<String>("buffer-db") {
            self.buffer.database_path = path.clone();
        }

        self.validate()
    }

    pub fn validate(&self) -> WatcherResult<()> {
        if self.buffer.capacity == 0 {
            return Err(WatcherError::Config("buffer.capacity must be > 0".to_string()));
        }
        if self.buffer.batch_size == 0 {
            return Err(WatcherError::Config("buffer.batch_size must be > 0".to_string()));
        }
        if self.watchdog.max_failed_restarts == 0 {
            return Err(WatcherError::Config(
                "watchdog.max_failed_restarts must be > 0".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for link in &self.links {
            if !names.insert(link.name.as_str()) {
                return Err(WatcherError::Config(format!("Duplicate link name '{}'", link.name)));
            }
            if link.fixed_path().is_none() && (link.usb_vid.is_none() || link.usb_pid.is_none()) {
                return Err(WatcherError::Config(format!(
                    "Link '{}' needs either device_path or usb_vid/usb_pid",
                    link.name
                )));
            }
            if let ReaderConfig::Modbus(modbus) = &link.reader {
                if !(1..=247).contains(&modbus.slave_address) {
                    return Err(WatcherError::Config(format!(
                        "Invalid Modbus address {} on link '{}'. Must be 1-247",
                        modbus.slave_address, link.name
                    )));
                }
                if let Some(register) = modbus
                    .registers
                    .iter()
                    .find(|r| u32::from(r.address) + u32::from(r.data_type.word_count()) > 0x1_0000)
                {
                    return Err(WatcherError::Config(format!(
                        "Register '{}' on link '{}' runs past address 0xFFFF",
                        register.name, link.name
                    )));
                }
                if modbus.registers.is_empty() {
                    return Err(WatcherError::Config(format!(
                        "Link '{}' has no registers to poll",
                        link.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.buffer.database_path)
    }

    pub fn get_link(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.watchdog.max_failed_restarts, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml = r#"
            watcher_name = "pi-17"

            [buffer]
            capacity = 1000

            [[links]]
            name = "meter"
            device_path = "/dev/ttyUSB1"

            [links.reader]
            kind = "modbus"
            slave_address = 2

            [[links.reader.registers]]
            name = "frequency"
            address = 70
            data_type = "f32"
            unit = "Hz"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.watcher_name, "pi-17");
        assert_eq!(config.buffer.capacity, 1000);
        assert_eq!(config.buffer.batch_size, 200);
        let link = config.get_link("meter").unwrap();
        assert_eq!(link.baud_rate, 9600);
        match &link.reader {
            ReaderConfig::Modbus(m) => {
                assert_eq!(m.slave_address, 2);
                assert_eq!(m.registers[0].scale, 1.0);
                assert_eq!(m.failure_threshold, 5);
            }
            other => panic!("unexpected reader {:?}", other),
        }
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/watcher.toml");
        let config = Config::default();
        config.save_to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.watcher_id, config.watcher_id);
        assert_eq!(loaded.links.len(), config.links.len());
    }

    #[test]
    fn loading_never_mints_a_watcher_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watcher.toml");
        std::fs::write(&path, "watcher_name = \"pi-17\"\n").unwrap();

        let first = Config::load_or_default(&path).unwrap();
        let second = Config::load_or_default(&path).unwrap();
        assert_eq!(first.watcher_id, second.watcher_id);
        assert!(first.watcher_id.is_empty());

        let missing = dir.path().join("missing.toml");
        let first = Config::load_or_default(&missing).unwrap();
        let second = Config::load_or_default(&missing).unwrap();
        assert_eq!(first.watcher_id, second.watcher_id);
    }

    #[test]
    fn rejects_register_past_the_address_space() {
        let mut config = Config::default();
        if let ReaderConfig::Modbus(m) = &mut config.links[1].reader {
            m.registers[0].address = 0xFFFF;
            m.registers[0].data_type = DataType::F32;
        }
        assert!(matches!(config.validate(), Err(WatcherError::Config(_))));
    }

    #[test]
    fn rejects_bad_modbus_address() {
        let mut config = Config::default();
        if let ReaderConfig::Modbus(m) = &mut config.links[1].reader {
            m.slave_address = 0;
        }
        assert!(matches!(config.validate(), Err(WatcherError::Config(_))));
    }
}

use clap::ArgMatches;
use log::info;
use std::path::Path;
use uuid::Uuid;

use super::settings::{Config, ReaderConfig, SinkConfig};
use crate::utils::error::{WatcherError, WatcherResult};

/// Handles `config <show|init|check>`. Returns `Ok(true)` when a
/// subcommand ran.
pub fn handle_config_commands(matches: &ArgMatches, config_path: &str) -> WatcherResult<bool> {
    if matches.subcommand_matches("show").is_some() {
        let config = Config::load_or_default(config_path)?;
        print!("{}", render(&config));
        return Ok(true);
    }

    if let Some(init) = matches.subcommand_matches("init") {
        let force = init.get_flag("force");
        write_default(config_path, force)?;
        println!("✅ Default configuration written to {}", config_path);
        return Ok(true);
    }

    if matches.subcommand_matches("check").is_some() {
        let config = Config::from_file(config_path)?;
        println!(
            "✅ {} is valid: {} link(s), buffer capacity {}",
            config_path,
            config.links.len(),
            config.buffer.capacity
        );
        return Ok(true);
    }

    Ok(false)
}

fn write_default(path: &str, force: bool) -> WatcherResult<()> {
    if Path::new(path).exists() && !force {
        return Err(WatcherError::Config(format!(
            "{} already exists, pass --force to overwrite",
            path
        )));
    }
    info!("📝 Writing default configuration to {}", path);
    let config = Config {
        watcher_id: Uuid::new_v4().to_string(),
        ..Config::default()
    };
    config.save_to_file(path)
}

fn render(config: &Config) -> String {
    let mut out = String::new();
    out.push_str("📋 Grid Connection Watcher Configuration:\n");
    out.push_str("═══════════════════════════════════════\n");
    if config.watcher_id.is_empty() {
        out.push_str("   🆔 Watcher ID: (stored in the sample buffer)\n");
    } else {
        out.push_str(&format!("   🆔 Watcher ID: {}\n", config.watcher_id));
    }
    out.push_str(&format!("   🏷️  Name: {}\n", config.watcher_name));
    out.push_str(&format!("   ⏳ Startup delay: {} s\n", config.startup_delay_seconds));

    out.push_str(&format!("\n🔌 Links ({}):\n", config.links.len()));
    for link in &config.links {
        let location = match (link.fixed_path(), link.usb_vid, link.usb_pid) {
            (Some(path), _, _) => path.to_string(),
            (None, Some(vid), Some(pid)) => format!("usb {:04x}:{:04x}", vid, pid),
            _ => "unresolved".to_string(),
        };
        let reader = match &link.reader {
            ReaderConfig::ModuleM(m) => format!("Module-M every {} ms", m.poll_interval_ms),
            ReaderConfig::Modbus(m) => format!(
                "Modbus slave {} ({} registers) every {} ms",
                m.slave_address,
                m.registers.len(),
                m.poll_interval_ms
            ),
        };
        out.push_str(&format!(
            "   🏷️  {} @ {} ({} baud): {}\n",
            link.name, location, link.baud_rate, reader
        ));
    }

    out.push_str("\n💾 Buffer:\n");
    out.push_str(&format!("   📁 {}\n", config.buffer.database_path));
    out.push_str(&format!(
        "   📦 capacity {}, batch {}\n",
        config.buffer.capacity, config.buffer.batch_size
    ));

    let sink = match &config.uploader.sink {
        SinkConfig::Http(http) => format!("http {}", http.endpoint),
        SinkConfig::File(file) => format!("file {}", file.path),
    };
    out.push_str(&format!("\n📤 Sink: {}\n", sink));
    out.push_str(&format!(
        "\n🐕 Watchdog: heartbeat {} s, grace {} s, {} restarts per {} s\n",
        config.watchdog.heartbeat_window_secs,
        config.watchdog.grace_period_secs,
        config.watchdog.max_failed_restarts,
        config.watchdog.restart_window_secs
    ));
    out
}

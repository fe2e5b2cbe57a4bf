use clap::ArgMatches;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use super::DEFAULT_CONFIG_PATH;
use crate::config::{handle_config_commands, Config};
use crate::firmware::debug::save_log;
use crate::firmware::{exit_code, DebugCommand, DebugSession, FirmwareJob, FirmwareUpdater, HttpImageSource, UsbUf2Target};
use crate::link::NativeOpener;
use crate::services::{GridWatcher, LinkLease};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn config_path(matches: &ArgMatches) -> String {
    matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Resolves on ctrl-c, or SIGTERM where available.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("⚠️  Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Entry point of the long-running watcher binary.
pub async fn run_watcher(matches: &ArgMatches) -> anyhow::Result<()> {
    let path = config_path(matches);

    if let Some(config_matches) = matches.subcommand_matches("config") {
        handle_config_commands(config_matches, &path)?;
        return Ok(());
    }

    let mut config = Config::load_or_default(&path)?;
    config.apply_matches(matches)?;

    if config.startup_delay_seconds > 0 {
        info!("⏳ Waiting {} s before opening devices", config.startup_delay_seconds);
        tokio::select! {
            _ = sleep(Duration::from_secs(config.startup_delay_seconds)) => {}
            _ = shutdown_signal() => {
                info!("🛑 Shutdown requested during startup delay");
                return Ok(());
            }
        }
    }

    let watcher = GridWatcher::new(config).await?;
    watcher.run(shutdown_signal()).await?;
    Ok(())
}

/// Entry point of the firmware update binary. Returns the process exit code.
pub async fn run_firmware_update(matches: &ArgMatches) -> i32 {
    let path = config_path(matches);
    let config = match Config::load_or_default(&path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration error: {}", e);
            return 1;
        }
    };
    let url = match matches.get_one::<String>("image-url") {
        Some(url) => url.clone(),
        None => {
            println!("❌ No image URL given");
            return 1;
        }
    };
    let checksum = matches.get_one::<String>("sha256").cloned();

    let lease = match LinkLease::acquire(&config.watchdog.lease_path) {
        Ok(lease) => lease,
        Err(e) => {
            println!("❌ Cannot take the Module-M link: {}", e);
            return 1;
        }
    };

    let (cancel, cancelled) = watch::channel(false);
    let canceller = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("🛑 Cancellation requested");
        let _ = cancel.send(true);
    });

    // Give the watcher a tick to notice the lease and release the port
    let settle = Duration::from_millis(config.firmware.lease_settle_ms);
    info!("⏳ Waiting {:?} for the watcher to release the link", settle);
    sleep(settle).await;

    let source = match HttpImageSource::new(DOWNLOAD_TIMEOUT) {
        Ok(source) => source,
        Err(e) => {
            println!("❌ {}", e);
            return 1;
        }
    };
    let target = UsbUf2Target::new(config.firmware.clone(), Arc::new(NativeOpener));
    let device_id = format!("usb:{:04x}:{:04x}", config.firmware.usb_vid, config.firmware.usb_pid);

    let mut job = FirmwareJob::new(&url, &device_id, checksum);
    let mut updater = FirmwareUpdater::new(config.firmware.clone(), Arc::new(source), Box::new(target), cancelled);
    let result = updater.execute(&mut job).await;

    canceller.abort();
    drop(lease);
    println!("{}", job.summary_line());
    exit_code(&result)
}

/// Entry point of the Module-M debug binary. Returns the process exit code.
pub async fn run_debug(matches: &ArgMatches) -> i32 {
    let path = config_path(matches);
    let config = match Config::load_or_default(&path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration error: {}", e);
            return 1;
        }
    };

    let command = match matches.subcommand() {
        Some(("send", send)) => {
            let name = send.get_one::<String>("command").map(String::as_str).unwrap_or_default();
            match DebugCommand::parse(name, send.get_one::<u8>("ct").copied()) {
                Ok(DebugCommand::TriggerBootloader) if !send.get_flag("yes") => {
                    println!("❌ 'bootloader' reboots Module-M into UF2 mode; pass --yes to confirm");
                    return 1;
                }
                Ok(command) => Some(command),
                Err(e) => {
                    println!("❌ {}", e);
                    return 1;
                }
            }
        }
        _ => None,
    };

    let lease = match LinkLease::acquire(&config.watchdog.lease_path) {
        Ok(lease) => lease,
        Err(e) => {
            println!("❌ Cannot take the Module-M link: {}", e);
            return 1;
        }
    };
    let settle = Duration::from_millis(config.firmware.lease_settle_ms);
    info!("⏳ Waiting {:?} for the watcher to release the link", settle);
    sleep(settle).await;

    let session = DebugSession::new(config.firmware.clone(), Arc::new(NativeOpener));
    let code = match command {
        Some(command) => match session.send(command).await {
            Ok(reply) if reply.trim().is_empty() => {
                println!("⚠️  No response from Module-M");
                1
            }
            Ok(reply) => {
                println!("{}", reply.trim_end());
                0
            }
            Err(e) => {
                println!("❌ {}", e);
                1
            }
        },
        None => {
            let output = matches
                .subcommand_matches("logs")
                .and_then(|logs| logs.get_one::<String>("output"));
            match session.fetch_logs().await {
                Ok(None) => {
                    println!("📭 Module-M reports that its log is empty");
                    0
                }
                Ok(Some(log)) => match output {
                    Some(file) => match save_log(file, &log) {
                        Ok(()) => {
                            println!("✅ Log saved to {}", file);
                            0
                        }
                        Err(e) => {
                            println!("❌ Cannot write {}: {}", file, e);
                            1
                        }
                    },
                    None => {
                        println!("--- Module-M log ---\n{}\n--- end of log ---", log.trim_end());
                        0
                    }
                },
                Err(e) => {
                    println!("❌ Failed to retrieve logs: {}", e);
                    1
                }
            }
        }
    };

    drop(lease);
    code
}

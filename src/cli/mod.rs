pub mod commands;

use clap::{Arg, ArgAction, Command};

use crate::firmware::DebugCommand;

pub const DEFAULT_CONFIG_PATH: &str = "config/watcher.toml";

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .value_name("PATH")
        .help("Configuration file")
        .default_value(DEFAULT_CONFIG_PATH)
}

/// `gridconnection_watcher [--config PATH] [--no-startup-delay] [--buffer-db PATH] [config ...]`
pub fn build_watcher_cli() -> Command {
    Command::new("gridconnection_watcher")
        .version(crate::VERSION)
        .about("Collects Module-M and Modbus grid telemetry and uploads it")
        .arg(config_arg())
        .arg(
            Arg::new("no-startup-delay")
                .long("no-startup-delay")
                .help("Skip the restart-storm delay before opening devices")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("buffer-db")
                .long("buffer-db")
                .value_name("PATH")
                .help("Override the sample buffer database path"),
        )
        .subcommand(
            Command::new("config")
                .about("Inspect or create the configuration file")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Print the effective configuration"))
                .subcommand(
                    Command::new("init").about("Write a default configuration file").arg(
                        Arg::new("force")
                            .long("force")
                            .help("Overwrite an existing file")
                            .action(ArgAction::SetTrue),
                    ),
                )
                .subcommand(Command::new("check").about("Load and validate the configuration file")),
        )
}

/// `manual_update_firmware <image-url> [--sha256 HEX] [--config PATH]`
pub fn build_update_cli() -> Command {
    Command::new("manual_update_firmware")
        .version(crate::VERSION)
        .about("Flash a UF2 firmware image onto Module-M")
        .arg(
            Arg::new("image-url")
                .value_name("IMAGE_URL")
                .help("Image URL; GitHub blob links are accepted")
                .required(true),
        )
        .arg(
            Arg::new("sha256")
                .long("sha256")
                .value_name("HEX")
                .help("Expected SHA-256; defaults to the <IMAGE_URL>.sha256 sidecar"),
        )
        .arg(config_arg())
}

/// `module_m_debug [--config PATH] <send COMMAND [--ct N] [--yes] | logs [--output FILE]>`
pub fn build_debug_cli() -> Command {
    Command::new("module_m_debug")
        .version(crate::VERSION)
        .about("Send service commands to Module-M and retrieve its debug log")
        .arg(config_arg())
        .subcommand_required(true)
        .subcommand(
            Command::new("send")
                .about("Send one service command and print the answer")
                .arg(
                    Arg::new("command")
                        .value_name("COMMAND")
                        .required(true)
                        .value_parser(DebugCommand::NAMES),
                )
                .arg(
                    Arg::new("ct")
                        .long("ct")
                        .value_name("N")
                        .help("CT number for ct-calibration")
                        .value_parser(clap::value_parser!(u8).range(1..=3)),
                )
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .help("Confirm commands that reboot the device")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("logs").about("Retrieve the device debug log").arg(
                Arg::new("output")
                    .long("output")
                    .short('o')
                    .value_name("FILE")
                    .help("Save the log here instead of printing it"),
            ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_flags_parse() {
        let matches = build_watcher_cli()
            .try_get_matches_from(["gridconnection_watcher", "--no-startup-delay", "--buffer-db", "/tmp/b.db"])
            .unwrap();
        assert!(matches.get_flag("no-startup-delay"));
        assert_eq!(matches.get_one::<String>("buffer-db").map(String::as_str), Some("/tmp/b.db"));
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some(DEFAULT_CONFIG_PATH)
        );
    }

    #[test]
    fn update_requires_image_url() {
        assert!(build_update_cli().try_get_matches_from(["manual_update_firmware"]).is_err());

        let matches = build_update_cli()
            .try_get_matches_from(["manual_update_firmware", "https://example.com/fw.uf2", "--sha256", "ab"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("image-url").map(String::as_str),
            Some("https://example.com/fw.uf2")
        );
        assert_eq!(matches.get_one::<String>("sha256").map(String::as_str), Some("ab"));
    }

    #[test]
    fn matches_apply_to_config() {
        let matches = build_watcher_cli()
            .try_get_matches_from(["gridconnection_watcher", "--no-startup-delay", "--buffer-db", "/tmp/b.db"])
            .unwrap();
        let mut config = crate::config::Config::default();
        config.apply_matches(&matches).unwrap();
        assert_eq!(config.startup_delay_seconds, 0);
        assert_eq!(config.buffer.database_path, "/tmp/b.db");
    }

    #[test]
    fn debug_commands_parse() {
        let matches = build_debug_cli()
            .try_get_matches_from(["module_m_debug", "send", "ct-calibration", "--ct", "2"])
            .unwrap();
        let (name, send) = matches.subcommand().unwrap();
        assert_eq!(name, "send");
        assert_eq!(send.get_one::<String>("command").map(String::as_str), Some("ct-calibration"));
        assert_eq!(send.get_one::<u8>("ct"), Some(&2));

        assert!(build_debug_cli()
            .try_get_matches_from(["module_m_debug", "send", "erase-everything"])
            .is_err());
        assert!(build_debug_cli()
            .try_get_matches_from(["module_m_debug", "send", "ct-calibration", "--ct", "4"])
            .is_err());

        let matches = build_debug_cli()
            .try_get_matches_from(["module_m_debug", "logs", "-o", "/tmp/mm.log"])
            .unwrap();
        let logs = matches.subcommand_matches("logs").unwrap();
        assert_eq!(logs.get_one::<String>("output").map(String::as_str), Some("/tmp/mm.log"));
    }
}

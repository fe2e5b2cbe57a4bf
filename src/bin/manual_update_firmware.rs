//! Flashes a UF2 image onto Module-M while the watcher keeps off the link.

use gridconnection_watcher::cli::{build_update_cli, commands};

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    // Usage errors exit 1 like every other setup failure
    let matches = match build_update_cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };
    let code = commands::run_firmware_update(&matches).await;
    std::process::exit(code);
}

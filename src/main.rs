use anyhow::Result;
use log::info;

use gridconnection_watcher::cli::{build_watcher_cli, commands};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    let matches = build_watcher_cli().get_matches();
    info!("🖥️  Grid Connection Watcher v{}", gridconnection_watcher::VERSION);

    commands::run_watcher(&matches).await
}

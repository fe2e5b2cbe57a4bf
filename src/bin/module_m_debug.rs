//! Module-M service commands and debug log retrieval over its USB serial
//! port, with the watcher kept off the link.

use gridconnection_watcher::cli::{build_debug_cli, commands};

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    let matches = match build_debug_cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };
    let code = commands::run_debug(&matches).await;
    std::process::exit(code);
}

mod archive;
mod cli;
mod logging;
mod metrics;
mod model;
mod object;
mod run;
mod storage;
mod sync;
#[cfg(test)]
mod test_utils;

use cli::SyncConfig;
use tracing::error;

/// Failures are logged; the process exits 0 regardless.
#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let config = match SyncConfig::try_from_argv(&argv) {
        Ok(config) => config,
        Err(err) => {
            let _ = err.print();
            return;
        }
    };
    logging::init_tracing(config.verbosity);

    if let Err(err) = run::run_sync(config, argv).await {
        error!(error = %format!("{err:#}"), "synchronization aborted");
    }
}

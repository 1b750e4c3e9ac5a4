//! treelinkd - spanning-tree server linking daemon.

use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use treelinkd::config::{Config, validate};
use treelinkd::sync::{VERSION, network};
use treelinkd::metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("TREELINKD_LOG_JSON").is_ok_and(|v| v == "1") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    if let Err(errors) = validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        return Err(anyhow::anyhow!(
            "{} configuration error(s) in {}",
            errors.len(),
            config_path
        ));
    }

    info!(
        server = %config.server.name,
        network = %config.server.network,
        links = config.link.len(),
        version = VERSION,
        "Starting treelinkd"
    );

    metrics::init();
    network::run(config, PathBuf::from(config_path)).await
}

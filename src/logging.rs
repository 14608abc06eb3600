use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initializes the global `tracing` subscriber: JSON-formatted, env-filterable,
/// with the default level taken from config rather than a hard-coded filter
/// string.
pub fn init(cfg: &LoggingConfig) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var(
            "RUST_LOG",
            format!("polymarket_acquisition_daemon={},info", cfg.level),
        );
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
}

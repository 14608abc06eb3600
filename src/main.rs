use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info};

use polymarket_acquisition_daemon::collectors::market_metadata::MarketMetadataCollector;
use polymarket_acquisition_daemon::collectors::orderbook_snapshot::OrderbookSnapshotCollector;
use polymarket_acquisition_daemon::collectors::price_snapshot::PriceSnapshotCollector;
use polymarket_acquisition_daemon::collectors::resolution_tracker::ResolutionTrackerCollector;
use polymarket_acquisition_daemon::collectors::trade_listener::TradeListener;
use polymarket_acquisition_daemon::config::{redact_dsn, AppConfig};
use polymarket_acquisition_daemon::db::pool::DbPool;
use polymarket_acquisition_daemon::db::run_migrations;
use polymarket_acquisition_daemon::supervisor::Daemon;
use polymarket_acquisition_daemon::venue::http::HttpVenueClient;
use polymarket_acquisition_daemon::venue::VenueClient;
use polymarket_acquisition_daemon::{config, logging};

#[derive(Parser, Debug)]
#[command(name = "polymarket-acquisition-daemon")]
#[command(about = "Continuous market/price/orderbook/trade acquisition daemon for Polymarket", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.toml", env = "ACQUISITION_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the acquisition daemon until a termination signal is received.
    Collect {},
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let cli = Cli::parse();

    let cfg = match AppConfig::from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config at {}: {e:#}", cli.config);
            std::process::exit(1);
        }
    };

    logging::init(&cfg.logging);

    match cli.command.unwrap_or(Commands::Collect {}) {
        Commands::Collect {} => {
            if let Err(e) = run_collect(cfg).await {
                error!(target: "main", error = %e, "fatal error during startup, exiting");
                std::process::exit(1);
            }
        }
    }
}

async fn run_collect(cfg: AppConfig) -> anyhow::Result<()> {
    let _secrets = config::Secrets::from_env();

    info!(
        target: "main",
        dsn = %redact_dsn(&cfg.database.dsn),
        http_host = %cfg.venue.http_host,
        ws_host = %cfg.venue.ws_host,
        "starting acquisition daemon"
    );

    let pool = Arc::new(DbPool::connect(&cfg.database).await?);

    let applied = run_migrations(pool.raw()).await?;
    info!(target: "main", applied = applied.len(), "migrations up to date");

    let venue: Arc<dyn VenueClient> =
        Arc::new(HttpVenueClient::new(cfg.venue.http_host.clone(), cfg.venue.ws_host.clone())?);

    let mut daemon = Daemon::new(pool.clone());

    daemon.register_collector(
        Arc::new(MarketMetadataCollector::new(venue.clone(), pool.clone())),
        Duration::from_secs(cfg.collector.market_refresh_interval_seconds),
    );
    daemon.register_collector(
        Arc::new(PriceSnapshotCollector::new(venue.clone(), pool.clone())),
        Duration::from_secs(cfg.collector.price_snapshot_interval_seconds),
    );
    daemon.register_collector(
        Arc::new(OrderbookSnapshotCollector::new(
            venue.clone(),
            pool.clone(),
            cfg.collector.orderbook_depth_levels,
        )),
        Duration::from_secs(cfg.collector.orderbook_snapshot_interval_seconds),
    );
    daemon.register_collector(
        Arc::new(ResolutionTrackerCollector::new(venue.clone(), pool.clone())),
        Duration::from_secs(cfg.collector.resolution_check_interval_seconds),
    );

    if cfg.collector.enable_websocket_trades {
        let listener = TradeListener::new(
            venue.clone(),
            pool.clone(),
            Duration::from_secs(cfg.collector.ws_ping_interval_seconds),
            500,
            Duration::from_secs(cfg.collector.trade_batch_drain_timeout_seconds),
        );
        daemon.register_trade_listener(listener);
    }

    let daemon = Arc::new(daemon);

    let run_handle = {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            daemon.run().await;
        })
    };

    wait_for_shutdown_signal().await;
    info!(target: "main", "termination signal received, shutting down");
    daemon.stop();

    let _ = run_handle.await;
    pool.close().await;

    info!(target: "main", "shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

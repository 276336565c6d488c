//! Porttrap - a low-interaction TCP honeypot
//!
//! Opens every port in a configured range and records who connects:
//! - Per-port connection statistics
//! - Raw payload capture with per-connection summaries
//! - GeoIP attribution of peers

use anyhow::Result;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use porttrap::config::Config;
use porttrap::enrich::{GeoDb, SharedEnricher};
use porttrap::events::EventBus;
use porttrap::manager::PortManager;
use porttrap::sink;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::INFO)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init();
    }

    info!("Starting porttrap...");

    let config = Config::load()?;
    info!(
        "Configuration loaded: range {}-{}, {} ports to bind",
        config.ports.range_start,
        config.ports.range_end,
        config.listen_ports().len()
    );

    let geodb = GeoDb::new(
        &config.enrichment.city_database,
        &config.enrichment.isp_database,
    );
    if !config.enrichment.enabled {
        info!("Enrichment disabled");
    } else if geodb.is_available() {
        info!("GeoIP enrichment enabled");
    } else {
        info!("GeoIP enrichment enabled but no database loaded; lookups will fail");
    }
    let enricher: SharedEnricher = Arc::new(geodb);

    let events = EventBus::new(1000);

    let sink_task = if config.logging.directory.is_empty() {
        None
    } else {
        Some(sink::spawn(&config.logging.directory, &events)?)
    };

    let manager = PortManager::start(&config, enricher, events.clone()).await;

    // Run until SIGINT or SIGTERM
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    manager.shutdown_all();
    manager.join().await;

    // Dropping the bus lets the sink flush and exit
    drop(events);
    if let Some(task) = sink_task {
        let _ = task.await;
    }

    Ok(())
}

//! Port manager range, skip-list and shutdown tests

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use porttrap::config::{Config, ConnectionConfig, EnrichmentConfig, LoggingConfig, PortsConfig};
use porttrap::enrich::{EnrichError, Enricher, GeoAttributes, SharedEnricher};
use porttrap::events::{EventBus, Notification};
use porttrap::listener::ListenerState;
use porttrap::manager::PortManager;

const WAIT: Duration = Duration::from_secs(5);

struct StaticEnricher;

#[async_trait]
impl Enricher for StaticEnricher {
    async fn resolve(&self, _ip: IpAddr) -> Result<GeoAttributes, EnrichError> {
        Ok(GeoAttributes::default())
    }
}

fn range_config(range_start: u16, range_end: u16, skip: Vec<u16>) -> Config {
    Config {
        ports: PortsConfig {
            host: "127.0.0.1".to_string(),
            range_start,
            range_end,
            skip,
        },
        connection: ConnectionConfig {
            idle_timeout_ms: 10_000,
            send: None,
            reply: None,
        },
        enrichment: EnrichmentConfig {
            enabled: false,
            city_database: String::new(),
            isp_database: String::new(),
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            directory: String::new(),
        },
    }
}

#[tokio::test]
async fn skip_list_is_honored_across_the_range() {
    // Range of 6 with 2 skipped, mirroring an [8000,8005] / skip 8002+8004
    // deployment but on ports unlikely to collide in CI
    let config = range_config(42110, 42115, vec![42112, 42114]);
    let events = EventBus::new(64);
    let mut notifications = events.subscribe();

    let enricher: SharedEnricher = Arc::new(StaticEnricher);
    let manager = PortManager::start(&config, enricher, events.clone()).await;

    let ports: Vec<u16> = manager.handles().iter().map(|h| h.port).collect();
    assert_eq!(ports, vec![42110, 42111, 42113, 42115]);
    for handle in manager.handles() {
        assert_eq!(handle.state(), ListenerState::Listening);
    }

    let mut started = 0;
    let mut skipped = 0;
    while let Ok(n) = notifications.try_recv() {
        match n.as_ref() {
            Notification::ListenerStarted { .. } => started += 1,
            Notification::ListenerSkipped { .. } => skipped += 1,
            _ => {}
        }
    }
    assert_eq!(started, 4);
    assert_eq!(skipped, 2);

    manager.shutdown_all();
    manager.join().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_each_listener_once() {
    let config = range_config(42120, 42123, vec![]);
    let events = EventBus::new(64);
    let mut notifications = events.subscribe();

    let enricher: SharedEnricher = Arc::new(StaticEnricher);
    let mut manager = PortManager::start(&config, enricher, events.clone()).await;

    manager.shutdown_all();
    // A second call must be a harmless no-op
    manager.shutdown_all();

    for handle in manager.handles_mut() {
        timeout(WAIT, handle.wait_for(|s| s.state == ListenerState::Closed))
            .await
            .unwrap();
    }
    manager.join().await;

    let mut closed = 0;
    while let Ok(n) = notifications.try_recv() {
        if matches!(n.as_ref(), Notification::ListenerClosed { .. }) {
            closed += 1;
        }
    }
    assert_eq!(closed, 4);
}

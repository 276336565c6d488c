//! Port manager: owns every listener in the configured range

use futures::future::join_all;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::connection::ResponsePolicy;
use crate::enrich::SharedEnricher;
use crate::events::{EventBus, Notification};
use crate::listener::{ListenerSettings, PortHandle, PortListener};

pub struct PortManager {
    handles: Vec<PortHandle>,
    shutdown_tx: watch::Sender<bool>,
}

impl PortManager {
    /// Bind one listener per port in `[range_start, range_end]` minus the
    /// skip list. Bind failures leave that listener `Errored` and never
    /// abort the rest of the range.
    pub async fn start(config: &Config, enricher: SharedEnricher, events: EventBus) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = ListenerSettings {
            host: config.ports.host.clone(),
            policy: ResponsePolicy::from_config(&config.connection),
            idle_timeout: config.idle_timeout(),
            enrichment_enabled: config.enrichment.enabled,
        };

        let mut handles = Vec::new();
        for port in config.ports.range_start..=config.ports.range_end {
            if config.ports.skip.contains(&port) {
                info!("Skipping port: {}", port);
                events.publish(Notification::ListenerSkipped { port });
                continue;
            }
            handles.push(
                PortListener::spawn(
                    port,
                    settings.clone(),
                    enricher.clone(),
                    events.clone(),
                    shutdown_rx.clone(),
                )
                .await,
            );
        }

        info!("Started {} listeners", handles.len());
        Self {
            handles,
            shutdown_tx,
        }
    }

    pub fn handles(&self) -> &[PortHandle] {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut [PortHandle] {
        &mut self.handles
    }

    /// Ask every non-closed listener to stop accepting and close its socket.
    /// Idempotent; in-flight connections are left to finish on their own.
    pub fn shutdown_all(&self) {
        info!("Closing all listeners...");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every listener task to drain its connections and exit
    pub async fn join(self) {
        join_all(self.handles.into_iter().map(|h| h.task)).await;
    }
}

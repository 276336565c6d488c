//! Per-port listener: accept loop and connection state machine
//!
//! Each bound port runs one task that owns the listener socket and every
//! piece of per-port state. Connection drivers and enrichment lookups run as
//! separate tasks and report back over an mpsc channel, so all registry and
//! counter mutation happens in one place.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{self, ConnEvent, ConnectionId, ConnectionRecord, ResponsePolicy};
use crate::enrich::{normalize_addr, Enrichment, SharedEnricher};
use crate::events::{EventBus, Notification};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    /// A listener-level error occurred; the listener keeps running
    Errored,
    /// The listening socket has been closed
    Closed,
}

/// Point-in-time view of a port's statistics, published over a watch channel
#[derive(Debug, Clone)]
pub struct PortStats {
    pub port: u16,
    pub state: ListenerState,
    pub local_addr: Option<SocketAddr>,
    pub last_error: Option<String>,
    pub connection_count: usize,
    pub active_connection_count: usize,
    pub unique_connection_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Per-listener knobs shared across all ports of a range
#[derive(Clone)]
pub struct ListenerSettings {
    pub host: String,
    pub policy: ResponsePolicy,
    pub idle_timeout: Duration,
    pub enrichment_enabled: bool,
}

/// Handle to a running listener task
pub struct PortHandle {
    pub port: u16,
    stats: watch::Receiver<PortStats>,
    pub(crate) task: tokio::task::JoinHandle<()>,
}

impl PortHandle {
    pub fn stats(&self) -> PortStats {
        self.stats.borrow().clone()
    }

    pub fn state(&self) -> ListenerState {
        self.stats.borrow().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stats.borrow().local_addr
    }

    /// Wait until the published stats satisfy `predicate`. Returns the last
    /// snapshot if the listener task ends first.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> PortStats
    where
        F: FnMut(&PortStats) -> bool,
    {
        loop {
            {
                let snapshot = self.stats.borrow_and_update();
                if predicate(&snapshot) {
                    return snapshot.clone();
                }
            }
            if self.stats.changed().await.is_err() {
                return self.stats.borrow().clone();
            }
        }
    }
}

pub struct PortListener;

impl PortListener {
    /// Bind `port` and spawn its listener task. A bind failure yields an
    /// `Errored` handle rather than an error, so one busy port never aborts
    /// the rest of the range.
    pub async fn spawn(
        port: u16,
        settings: ListenerSettings,
        enricher: SharedEnricher,
        events: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> PortHandle {
        let addr = format!("{}:{}", settings.host, port);

        let (listener, state) = match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let mut state = PortState::new(port, ListenerState::Listening);
                state.local_addr = listener.local_addr().ok();
                info!("Listening on {}", addr);
                events.publish(Notification::ListenerStarted { port });
                (Some(listener), state)
            }
            Err(e) => {
                warn!("Cannot bind to {}: {}", addr, e);
                let mut state = PortState::new(port, ListenerState::Errored);
                state.last_error = Some(e.to_string());
                events.publish(Notification::ListenerError {
                    port,
                    error: e.to_string(),
                });
                (None, state)
            }
        };

        let (stats_tx, stats_rx) = watch::channel(state.snapshot());
        let task = tokio::spawn(run(state, stats_tx, listener, settings, enricher, events, shutdown));

        PortHandle {
            port,
            stats: stats_rx,
            task,
        }
    }
}

async fn run(
    mut state: PortState,
    stats_tx: watch::Sender<PortStats>,
    mut listener: Option<TcpListener>,
    settings: ListenerSettings,
    enricher: SharedEnricher,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Dropped on shutdown so the channel drains once in-flight drivers finish
    let mut accept_tx = Some(tx);
    let mut closing = false;

    loop {
        tokio::select! {
            res = maybe_accept(listener.as_ref()) => {
                match res {
                    Ok((socket, peer)) => {
                        if let Some(tx) = accept_tx.as_ref() {
                            state.on_accept(socket, peer, &settings, &enricher, &events, tx);
                            let _ = stats_tx.send(state.snapshot());
                        }
                    }
                    Err(e) => {
                        warn!("Accept error on port {}: {}", state.port, e);
                        state.state = ListenerState::Errored;
                        state.last_error = Some(e.to_string());
                        events.publish(Notification::ListenerError {
                            port: state.port,
                            error: e.to_string(),
                        });
                        let _ = stats_tx.send(state.snapshot());
                    }
                }
            }
            changed = shutdown.changed(), if !closing => {
                // A dropped manager counts as a close request
                let requested = changed.is_err() || *shutdown.borrow();
                if requested {
                    closing = true;
                    // Stop accepting; in-flight connections run to completion
                    listener = None;
                    accept_tx = None;
                    if state.state != ListenerState::Closed {
                        state.state = ListenerState::Closed;
                        info!("Listener on port {} closed", state.port);
                        events.publish(Notification::ListenerClosed { port: state.port });
                        let _ = stats_tx.send(state.snapshot());
                    }
                }
            }
            ev = rx.recv() => {
                match ev {
                    Some(ev) => {
                        if state.on_event(ev, &events) {
                            let _ = stats_tx.send(state.snapshot());
                        }
                    }
                    // All drivers finished after shutdown
                    None => break,
                }
            }
        }
    }
}

async fn maybe_accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// All mutable per-port state, owned by the listener task
struct PortState {
    port: u16,
    state: ListenerState,
    local_addr: Option<SocketAddr>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    /// Append-only; records persist after close for the statistics lifetime
    history: Vec<ConnectionRecord>,
    /// Every record's slot in `history`, for late enrichment arrivals
    index: HashMap<ConnectionId, usize>,
    /// Open connections, keyed by identity and never by address
    active: HashSet<ConnectionId>,
    /// Normalized addresses ever seen, so uniqueness is O(1) per accept
    seen_addrs: HashSet<IpAddr>,
}

impl PortState {
    fn new(port: u16, state: ListenerState) -> Self {
        Self {
            port,
            state,
            local_addr: None,
            last_error: None,
            created_at: Utc::now(),
            history: Vec::new(),
            index: HashMap::new(),
            active: HashSet::new(),
            seen_addrs: HashSet::new(),
        }
    }

    fn snapshot(&self) -> PortStats {
        PortStats {
            port: self.port,
            state: self.state,
            local_addr: self.local_addr,
            last_error: self.last_error.clone(),
            connection_count: self.history.len(),
            active_connection_count: self.active.len(),
            unique_connection_count: self.seen_addrs.len(),
            created_at: self.created_at,
        }
    }

    fn on_accept(
        &mut self,
        socket: TcpStream,
        peer: SocketAddr,
        settings: &ListenerSettings,
        enricher: &SharedEnricher,
        events: &EventBus,
        tx: &mpsc::UnboundedSender<ConnEvent>,
    ) {
        let id = ConnectionId::new();
        let normalized = normalize_addr(peer.ip());

        // Accounting reflects the accept itself, before enrichment resolves
        let mut record = ConnectionRecord::new(id, self.port, peer, normalized);
        if !settings.enrichment_enabled {
            record.enrichment = Enrichment::Skipped;
        }
        self.seen_addrs.insert(normalized);
        self.index.insert(id, self.history.len());
        self.active.insert(id);
        self.history.push(record);

        debug!(port = self.port, conn_id = %id, peer = %peer, "Connection accepted");
        events.publish(Notification::ConnectionAccepted {
            port: self.port,
            connection_id: id,
            remote_addr: peer,
        });

        if settings.enrichment_enabled {
            let enricher = enricher.clone();
            let enrich_tx = tx.clone();
            tokio::spawn(async move {
                let outcome = Enrichment::from_result(enricher.resolve(normalized).await);
                let _ = enrich_tx.send(ConnEvent::Enriched { id, outcome });
            });
        }

        tokio::spawn(connection::drive(
            socket,
            id,
            settings.policy.clone(),
            settings.idle_timeout,
            tx.clone(),
        ));
    }

    /// Returns true when the event changed anything worth republishing
    fn on_event(&mut self, ev: ConnEvent, events: &EventBus) -> bool {
        match ev {
            ConnEvent::Data { id, chunk } => {
                if let Some(record) = self.record_mut(id) {
                    record.chunks.push(chunk);
                }
                false
            }
            ConnEvent::Sent { id, message } => {
                if let Some(record) = self.record_mut(id) {
                    record.sent.push(message);
                }
                false
            }
            ConnEvent::Enriched { id, outcome } => {
                // May land after close; the record is updated but counters
                // and notifications are left alone
                if let Some(record) = self.record_mut(id) {
                    record.enrichment = outcome;
                }
                false
            }
            ConnEvent::Closed { id } => self.on_close(id, events),
        }
    }

    fn on_close(&mut self, id: ConnectionId, events: &EventBus) -> bool {
        let Some(record) = self.record_mut(id) else {
            return false;
        };
        if !record.mark_closed() {
            return false;
        }
        let summary = record.summary();
        // Removal keys off the identity; an unrelated connection sharing the
        // same peer address is never touched
        self.active.remove(&id);

        info!(
            port = self.port,
            conn_id = %id,
            peer = %summary.remote_addr,
            bytes_received = summary.bytes_received,
            messages_sent = summary.messages_sent,
            duration_ms = summary.duration_ms,
            "Connection closed"
        );
        events.publish(Notification::ConnectionClosed { summary });
        true
    }

    fn record_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionRecord> {
        let idx = *self.index.get(&id)?;
        self.history.get_mut(idx)
    }
}

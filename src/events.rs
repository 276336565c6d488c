//! Event bus for broadcasting listener and connection notifications

use crate::connection::{ConnectionId, ConnectionSummary};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything an external sink can observe about the honeypot
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    ListenerStarted { port: u16 },
    ListenerSkipped { port: u16 },
    ListenerError { port: u16, error: String },
    ListenerClosed { port: u16 },
    ConnectionAccepted {
        port: u16,
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
    },
    ConnectionClosed { summary: ConnectionSummary },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Notification>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, notification: Notification) {
        let _ = self.sender.send(Arc::new(notification));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.sender.subscribe()
    }
}

//! Per-connection state and the socket driver task

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::enrich::Enrichment;

/// Stable identity of one accepted socket. Never derived from the peer
/// address: multiple simultaneous connections can share an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What, if anything, the honeypot sends on a connection
#[derive(Debug, Clone)]
pub enum ResponsePolicy {
    /// Never send; the peer or the idle timer closes the connection
    Silent,
    /// Send once at accept and close, without reading anything
    ImmediateSend(Bytes),
    /// Reply to inbound data. The reply carries the write-side FIN, so only
    /// the first data event is ever answered; later chunks are still
    /// captured but produce no send. Intended behavior.
    EchoOnData(Bytes),
}

impl ResponsePolicy {
    /// `send` wins over `reply` when both are configured
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let nonempty = |s: &Option<String>| {
            s.as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
        };
        if let Some(msg) = nonempty(&config.send) {
            ResponsePolicy::ImmediateSend(msg)
        } else if let Some(msg) = nonempty(&config.reply) {
            ResponsePolicy::EchoOnData(msg)
        } else {
            ResponsePolicy::Silent
        }
    }
}

/// Tracked state of one accepted socket, owned by its port's listener task
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub port: u16,
    pub remote_addr: SocketAddr,
    /// Peer IP with the IPv4-mapped-IPv6 prefix stripped
    pub normalized_addr: IpAddr,
    pub enrichment: Enrichment,
    pub chunks: Vec<Bytes>,
    pub sent: Vec<Bytes>,
    pub closed: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, port: u16, remote_addr: SocketAddr, normalized_addr: IpAddr) -> Self {
        Self {
            id,
            port,
            remote_addr,
            normalized_addr,
            enrichment: Enrichment::Pending,
            chunks: Vec::new(),
            sent: Vec::new(),
            closed: false,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Terminal and idempotent: returns false if the record was already closed
    pub fn mark_closed(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.closed_at = Some(Utc::now());
        true
    }

    pub fn bytes_received(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn summary(&self) -> ConnectionSummary {
        let payload = if self.chunks.is_empty() {
            None
        } else {
            // Hex-encoded so arbitrary bytes survive the JSON sink
            Some(hex::encode(self.chunks.concat()))
        };
        ConnectionSummary {
            connection_id: self.id,
            port: self.port,
            remote_addr: self.remote_addr,
            normalized_addr: self.normalized_addr,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            duration_ms: self
                .closed_at
                .map(|t| (t - self.opened_at).num_milliseconds()),
            bytes_received: self.bytes_received(),
            chunks: self.chunks.len(),
            messages_sent: self.sent.len(),
            payload,
            enrichment: self.enrichment.clone(),
        }
    }
}

/// Flat view of a finished (or finishing) connection, emitted on close
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub port: u16,
    pub remote_addr: SocketAddr,
    pub normalized_addr: IpAddr,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub bytes_received: usize,
    pub chunks: usize,
    pub messages_sent: usize,
    pub payload: Option<String>,
    pub enrichment: Enrichment,
}

/// Events a connection's driver (or its enrichment task) reports back to the
/// owning listener. All record mutation happens on the listener side.
#[derive(Debug)]
pub enum ConnEvent {
    Data { id: ConnectionId, chunk: Bytes },
    Sent { id: ConnectionId, message: Bytes },
    Enriched { id: ConnectionId, outcome: Enrichment },
    Closed { id: ConnectionId },
}

/// Drive one socket to completion: apply the response policy, capture inbound
/// data, and race the idle timer. Always ends by reporting `Closed` exactly
/// once. Dropping out of the select cancels the timer, so it can never fire
/// after an earlier close.
pub(crate) async fn drive(
    socket: TcpStream,
    id: ConnectionId,
    policy: ResponsePolicy,
    idle_timeout: Duration,
    tx: mpsc::UnboundedSender<ConnEvent>,
) {
    let (mut reader, mut writer) = socket.into_split();

    if let ResponsePolicy::ImmediateSend(msg) = &policy {
        if writer.write_all(msg).await.is_ok() {
            let _ = tx.send(ConnEvent::Sent {
                id,
                message: msg.clone(),
            });
        }
        let _ = writer.shutdown().await;
        let _ = tx.send(ConnEvent::Closed { id });
        return;
    }

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);
    let mut buf = vec![0u8; 4096];
    let mut replied = false;

    loop {
        tokio::select! {
            _ = &mut idle => {
                debug!(conn_id = %id, "Idle timeout reached, closing connection");
                break;
            }
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    let _ = tx.send(ConnEvent::Data {
                        id,
                        chunk: Bytes::copy_from_slice(&buf[..n]),
                    });
                    if let ResponsePolicy::EchoOnData(msg) = &policy {
                        if !replied {
                            if writer.write_all(msg).await.is_ok() {
                                let _ = tx.send(ConnEvent::Sent {
                                    id,
                                    message: msg.clone(),
                                });
                            }
                            // Carries the FIN; nothing is sent for later chunks
                            let _ = writer.shutdown().await;
                            replied = true;
                        }
                    }
                }
                Err(e) => {
                    debug!(conn_id = %id, "Socket error: {}", e);
                    break;
                }
            }
        }
    }

    let _ = tx.send(ConnEvent::Closed { id });
}

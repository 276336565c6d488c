//! Connection log sink
//!
//! Subscribes to the notification bus and appends one JSON line per closed
//! connection under the configured log directory. Writes are buffered and
//! flushed on an interval so a burst of connections does not stall the
//! listeners.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::{EventBus, Notification};

const FLUSH_INTERVAL_MS: u64 = 250;

/// Start the sink task. Creates the log directory if needed and returns the
/// task handle; the task exits once the bus is dropped, flushing first.
pub fn spawn(directory: &str, events: &EventBus) -> Result<JoinHandle<()>> {
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Cannot create log directory: {}", directory))?;
    let path = Path::new(directory).join("connections.jsonl");
    let rx = events.subscribe();
    Ok(tokio::spawn(run(path, rx)))
}

async fn run(path: PathBuf, mut rx: broadcast::Receiver<Arc<Notification>>) {
    let file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!("Cannot open connection log {}: {}", path.display(), e);
            return;
        }
    };
    let mut writer = BufWriter::new(file);
    let mut flush_interval =
        tokio::time::interval(tokio::time::Duration::from_millis(FLUSH_INTERVAL_MS));
    let mut dirty = false;

    info!("Connection log started: {}", path.display());

    loop {
        tokio::select! {
            notification = rx.recv() => {
                match notification {
                    Ok(n) => {
                        if let Notification::ConnectionClosed { summary } = n.as_ref() {
                            match serde_json::to_vec(summary) {
                                Ok(mut line) => {
                                    line.push(b'\n');
                                    if let Err(e) = writer.write_all(&line).await {
                                        warn!("Failed to write connection log: {}", e);
                                    } else {
                                        dirty = true;
                                    }
                                }
                                Err(e) => warn!("Failed to serialize summary: {}", e),
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Connection log lagged, dropped {} notifications", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = flush_interval.tick() => {
                if dirty {
                    let _ = writer.flush().await;
                    dirty = false;
                }
            }
        }
    }

    let _ = writer.flush().await;
    info!("Connection log shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionRecord};
    use crate::enrich::normalize_addr;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn closed_connections_are_written_as_json_lines() {
        let dir = std::env::temp_dir().join(format!("porttrap-sink-{}", uuid::Uuid::new_v4()));
        let events = EventBus::new(16);
        let task = spawn(dir.to_str().unwrap(), &events).unwrap();

        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let mut record =
            ConnectionRecord::new(ConnectionId::new(), 8000, addr, normalize_addr(addr.ip()));
        record.mark_closed();
        events.publish(Notification::ConnectionClosed {
            summary: record.summary(),
        });
        // Non-connection notifications are ignored by the sink
        events.publish(Notification::ListenerStarted { port: 8000 });

        drop(events);
        task.await.unwrap();

        let contents = std::fs::read_to_string(dir.join("connections.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["port"], 8000);
        assert_eq!(parsed["remote_addr"], "127.0.0.1:50000");

        let _ = std::fs::remove_dir_all(&dir);
    }
}

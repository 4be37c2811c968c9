//! Connection handles and the per-instance connection registry.
//!
//! Uses lock-free DashMap for concurrent access from connection tasks and
//! partition consumers. The registry only knows about sockets attached to
//! this instance.

use crate::error::{GatewayError, Result};
use crate::protocol::{Message, RecipientId};
use axum::extract::ws;
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique id of one socket session.
pub type ConnectionId = Uuid;

/// Default buffer size for outbound connection queues.
pub const OUTBOUND_BUFFER_SIZE: usize = 1000;

/// One live socket session.
///
/// Writes go through a bounded queue drained by the connection's writer
/// task, so sending never blocks the caller.
pub struct Connection {
    /// Unique connection id.
    pub id: ConnectionId,
    /// Identity the connection was opened for.
    pub recipient: RecipientId,
    /// Timestamp when the connection was opened.
    pub connected_at: i64,
    tx: mpsc::Sender<ws::Message>,
    last_ping: AtomicI64,
    failed_sends: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    /// Create a connection writing into `tx`.
    pub fn new(recipient: RecipientId, tx: mpsc::Sender<ws::Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            recipient,
            connected_at: now,
            tx,
            last_ping: AtomicI64::new(now),
            failed_sends: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Send a message to the client.
    ///
    /// Fails if the connection is closed or its queue is full. Either failure
    /// closes the connection: a client that stopped draining its queue is
    /// evicted rather than silently dropping messages.
    pub fn send(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::ConnectionClosed);
        }
        let json = serde_json::to_string(msg)?;
        self.tx.try_send(ws::Message::Text(json.into())).map_err(|e| {
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
            let err = match e {
                mpsc::error::TrySendError::Closed(_) => GatewayError::ConnectionClosed,
                mpsc::error::TrySendError::Full(_) => {
                    counter!("gateway_slow_consumer_evictions_total").increment(1);
                    GatewayError::ChannelSend
                }
            };
            warn!("Send to {} failed ({}), closing connection {}", self.recipient, err, self.id);
            self.close();
            err
        })
    }

    /// Queue a raw frame (ping/pong). Returns false if it could not be queued.
    pub fn send_raw(&self, frame: ws::Message) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Close the connection. Idempotent.
    ///
    /// Wakes the read loop waiting on [`Connection::closed`] and queues a
    /// close frame for the writer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_one();
        let _ = self.tx.try_send(ws::Message::Close(None));
        debug!("Connection {} for {} closed", self.id, self.recipient);
    }

    /// Whether [`Connection::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }

    /// Number of sends that failed so far.
    pub fn failed_sends(&self) -> u64 {
        self.failed_sends.load(Ordering::Relaxed)
    }

    /// Update the last ping timestamp.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the last ping timestamp.
    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }
}

/// Recipient → live connection, for this instance only.
///
/// One connection per recipient. A reconnect supersedes the previous
/// connection, which is closed.
pub struct ConnectionRegistry {
    connections: DashMap<RecipientId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Store the live connection for `id`, closing and returning any
    /// connection it supersedes.
    pub fn put(&self, id: RecipientId, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let conn_id = conn.id;
        let previous = self.connections.insert(id, conn);
        info!("Connection {} registered for {}", conn_id, id);

        match previous {
            Some(prev) if prev.id != conn_id => {
                warn!(
                    "Connection {} for {} superseded by {}",
                    prev.id, id, conn_id
                );
                prev.close();
                Some(prev)
            }
            _ => None,
        }
    }

    /// Look up the live connection for `id`.
    pub fn get(&self, id: RecipientId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    /// Remove the entry for `id`. Removing an absent id is a no-op.
    pub fn delete(&self, id: RecipientId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, c)| c);
        if let Some(conn) = &removed {
            info!("Connection {} unregistered for {}", conn.id, id);
        }
        removed
    }

    /// Remove the entry for `id` only if it still refers to `conn_id`.
    pub fn delete_if_current(&self, id: RecipientId, conn_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(&id, |_, c| c.id == conn_id)
            .is_some();
        if removed {
            info!("Connection {} unregistered for {}", conn_id, id);
        }
        removed
    }

    /// Remove the entry for `id` if its connection has been closed.
    pub fn remove_closed(&self, id: RecipientId) -> Option<Arc<Connection>> {
        let removed = self
            .connections
            .remove_if(&id, |_, c| c.is_closed())
            .map(|(_, c)| c);
        if let Some(conn) = &removed {
            info!("Closed connection {} unregistered for {}", conn.id, id);
        }
        removed
    }

    /// Get the total number of connected recipients.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close and remove connections that haven't pinged in a while.
    /// Returns how many were removed.
    pub fn cleanup_stale(&self, max_idle_ms: i64) -> usize {
        let now = Utc::now().timestamp_millis();
        let stale: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| now - entry.value().last_ping_time() > max_idle_ms)
            .map(|entry| entry.value().clone())
            .collect();

        let mut removed = 0;
        for conn in stale {
            if self.delete_if_current(conn.recipient, conn.id) {
                warn!("Removing stale connection {} for {}", conn.id, conn.recipient);
                conn.close();
                removed += 1;
            }
        }
        removed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

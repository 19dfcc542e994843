//! Per-user WebSocket fan-out and the worker-to-event-loop bridge.
//!
//! The scheduler worker is a plain thread; it cannot touch sockets. It
//! writes [`Notification`]s into a bounded inbox, and a single pump task
//! on the runtime drains them: persist the job snapshot, then fan the
//! event out to the owner's live connections. Per-socket ordering is
//! FIFO (one unbounded channel per socket); ordering across a user's
//! sockets is not guaranteed.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::Notification;
use crate::store::JobStore;

/// Size of the worker-to-pump inbox. Full means events drop (best
/// effort), never that the worker blocks.
pub const NOTIFY_INBOX_CAPACITY: usize = 1024;

struct Connection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// Registry of live status sockets per user.
#[derive(Debug, Default)]
pub struct NotificationHub {
    connections: DashMap<String, Vec<Connection>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

impl NotificationHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket for `user_id`; the returned receiver yields the
    /// serialized messages to forward, in send order.
    pub fn connect(&self, user_id: &str) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.connections
            .entry(user_id.to_owned())
            .or_default()
            .push(Connection { id, tx });
        tracing::info!(owner_id = %user_id, connection_id = %id, "status socket connected");
        (id, rx)
    }

    /// Drop a socket registration. In-flight jobs are unaffected.
    pub fn disconnect(&self, user_id: &str, connection_id: Uuid) {
        if let Some(mut entry) = self.connections.get_mut(user_id) {
            entry.retain(|c| c.id != connection_id);
            let now_empty = entry.is_empty();
            drop(entry);
            if now_empty {
                self.connections.remove_if(user_id, |_, conns| conns.is_empty());
            }
        }
        tracing::info!(owner_id = %user_id, connection_id = %connection_id, "status socket disconnected");
    }

    /// Number of live sockets for a user.
    #[must_use]
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections.get(user_id).map_or(0, |c| c.len())
    }

    /// Fan a message out to every socket of one user, best effort. A
    /// closed socket is skipped; cleanup happens on disconnect.
    pub fn send_to_user(&self, user_id: &str, message: &Value) {
        let Some(entry) = self.connections.get(user_id) else {
            return;
        };
        let text = message.to_string();
        for connection in entry.iter() {
            if connection.tx.send(text.clone()).is_err() {
                tracing::debug!(
                    owner_id = %user_id,
                    connection_id = %connection.id,
                    "send to closed status socket skipped"
                );
            }
        }
    }
}

/// Drain the scheduler's notification inbox on the async side.
///
/// Every event persists a job snapshot (artifact availability is
/// recomputed inside the store) before fan-out, so the durable view
/// never lags the live one by more than the event in flight.
pub async fn run_pump(
    mut rx: mpsc::Receiver<Notification>,
    hub: Arc<NotificationHub>,
    job_store: JobStore,
) {
    while let Some(notification) = rx.recv().await {
        if let Err(err) = job_store.upsert_job(&notification.snapshot).await {
            tracing::warn!(
                job_id = %notification.snapshot.id,
                error = %err,
                "job snapshot persist failed"
            );
        }
        match serde_json::to_value(&notification.event) {
            Ok(message) => hub.send_to_user(&notification.owner_id, &message),
            Err(err) => {
                tracing::error!(error = %err, "job event serialization failed");
            }
        }
    }
    tracing::info!("notification pump stopped");
}

//! The connection manager: keyed registries for each streaming variant,
//! snapshot iteration, and best-effort broadcast.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::stream::duplex::DuplexConnection;
use crate::stream::push::{PushConnection, SseEvent};
use crate::stream::{ConnectionState, Metadata, StreamError, StreamKind};

/// A predicate over connection metadata used to filter broadcast recipients.
pub type MetadataFilter<'a> = &'a dyn Fn(&Metadata) -> bool;

/// Tracks every live streaming connection, keyed by client id, one registry
/// per variant.
///
/// Mutation is guarded by read-biased locks; iteration snapshots the
/// registry so no lock is held while messages are enqueued.
#[derive(Default)]
pub struct ConnectionManager {
    duplex: RwLock<HashMap<String, Arc<DuplexConnection>>>,
    push: RwLock<HashMap<String, Arc<PushConnection>>>,
}

impl ConnectionManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ConnectionManager::default())
    }

    pub(crate) fn register_duplex(&self, conn: Arc<DuplexConnection>) {
        debug!("[ws:{}] registered", conn.client_id());
        self.duplex
            .write()
            .expect("duplex registry poisoned")
            .insert(conn.client_id().to_string(), conn);
    }

    pub(crate) fn unregister_duplex(&self, client_id: &str) {
        debug!("[ws:{}] unregistered", client_id);
        self.duplex
            .write()
            .expect("duplex registry poisoned")
            .remove(client_id);
    }

    pub(crate) fn register_push(&self, conn: Arc<PushConnection>) {
        debug!("[sse:{}] registered", conn.client_id());
        self.push
            .write()
            .expect("push registry poisoned")
            .insert(conn.client_id().to_string(), conn);
    }

    pub(crate) fn unregister_push(&self, client_id: &str) {
        debug!("[sse:{}] unregistered", client_id);
        self.push
            .write()
            .expect("push registry poisoned")
            .remove(client_id);
    }

    /// The duplex connection registered under `client_id`, if any.
    pub fn duplex(&self, client_id: &str) -> Option<Arc<DuplexConnection>> {
        self.duplex
            .read()
            .expect("duplex registry poisoned")
            .get(client_id)
            .cloned()
    }

    /// The push connection registered under `client_id`, if any.
    pub fn push(&self, client_id: &str) -> Option<Arc<PushConnection>> {
        self.push
            .read()
            .expect("push registry poisoned")
            .get(client_id)
            .cloned()
    }

    /// The number of connections currently registered for a variant.
    pub fn count(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Duplex => self.duplex.read().expect("duplex registry poisoned").len(),
            StreamKind::Push => self.push.read().expect("push registry poisoned").len(),
        }
    }

    /// A snapshot of the currently registered duplex connections.
    pub fn duplex_connections(&self) -> Vec<Arc<DuplexConnection>> {
        self.duplex
            .read()
            .expect("duplex registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// A snapshot of the currently registered push connections.
    pub fn push_connections(&self) -> Vec<Arc<PushConnection>> {
        self.push
            .read()
            .expect("push registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Enqueues `message` to every open duplex connection, optionally
    /// filtered by a metadata predicate.
    ///
    /// Best-effort per connection: a slow consumer is closed and skipped,
    /// and the broadcast continues. Returns the number of successful
    /// enqueues.
    pub fn broadcast_duplex<T: Serialize>(
        &self,
        message: &T,
        filter: Option<MetadataFilter<'_>>,
    ) -> Result<usize, StreamError> {
        let text = serde_json::to_string(message)?;
        let mut delivered = 0;

        for conn in self.duplex_connections() {
            if conn.state() != ConnectionState::Open {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(conn.metadata()) {
                    continue;
                }
            }
            match conn.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    "[ws:{}] broadcast enqueue failed: {}",
                    conn.client_id(),
                    err
                ),
            }
        }

        Ok(delivered)
    }

    /// Enqueues `event` to every open push connection, optionally filtered
    /// by a metadata predicate. Best-effort, as for duplex broadcast.
    pub fn broadcast_push(&self, event: &SseEvent, filter: Option<MetadataFilter<'_>>) -> usize {
        let mut delivered = 0;

        for conn in self.push_connections() {
            if conn.state() != ConnectionState::Open {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(conn.metadata()) {
                    continue;
                }
            }
            match conn.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    "[sse:{}] broadcast enqueue failed: {}",
                    conn.client_id(),
                    err
                ),
            }
        }

        delivered
    }

    /// Gracefully shuts down every connection: broadcasts the shutdown
    /// notice, transitions everything to `Closing`, waits up to `grace` for
    /// writers to drain, and force-closes the remainder.
    pub async fn shutdown(&self, grace: Duration) {
        info!("shutting down streaming connections");

        let _ = self.broadcast_duplex(&json!({ "type": "server_shutdown" }), None);
        if let Ok(event) = SseEvent::new("shutdown", &json!({})) {
            self.broadcast_push(&event, None);
        }

        for conn in self.duplex_connections() {
            conn.close();
        }
        for conn in self.push_connections() {
            conn.close();
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Whatever is left gets the abrupt treatment.
        let remaining: Vec<_> = self.duplex_connections();
        for conn in remaining {
            warn!("[ws:{}] force closing", conn.client_id());
        }
        self.duplex
            .write()
            .expect("duplex registry poisoned")
            .clear();
        self.push.write().expect("push registry poisoned").clear();
    }

    fn is_empty(&self) -> bool {
        self.count(StreamKind::Duplex) == 0 && self.count(StreamKind::Push) == 0
    }
}

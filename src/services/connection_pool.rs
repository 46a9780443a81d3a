//! Registry of active sessions able to perform lookups.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::models::SessionId;
use crate::domain::ports::LookupConnection;

/// Pool of lookup connections keyed by session id.
///
/// Selection rotates over the currently available connections so load spreads
/// evenly; there is no per-caller affinity.
#[derive(Default)]
pub struct ConnectionPool {
    connections: DashMap<SessionId, Arc<dyn LookupConnection>>,
    cursor: AtomicUsize,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the connection for a session.
    pub fn register(&self, session_id: SessionId, connection: Arc<dyn LookupConnection>) {
        let replaced = self.connections.insert(session_id, connection).is_some();
        info!(session_id = %session_id, replaced, total = self.connections.len(), "lookup connection registered");
    }

    /// Remove a session's connection. Returns false if it was not registered.
    pub fn unregister(&self, session_id: SessionId) -> bool {
        let removed = self.connections.remove(&session_id).is_some();
        if removed {
            info!(session_id = %session_id, total = self.connections.len(), "lookup connection unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// All registered connections, available or not.
    pub fn connections(&self) -> Vec<(SessionId, Arc<dyn LookupConnection>)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Pick any currently available connection.
    pub fn select_available(&self) -> Option<(SessionId, Arc<dyn LookupConnection>)> {
        let mut available: Vec<(SessionId, Arc<dyn LookupConnection>)> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_available())
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        if available.is_empty() {
            debug!(registered = self.connections.len(), "no lookup connection available");
            return None;
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
        Some(available.swap_remove(index))
    }
}

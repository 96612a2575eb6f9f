//! Connection registry.
//!
//! The registry is the single shared mutable collection of connections.
//! A connection is reachable from it if and only if it may receive future
//! broadcasts. Registration, removal and snapshotting all go through here.

use crate::connection::{Connection, ConnectionId, ConnectionState, FrameSink, Registration};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The hub is shutting down and accepts no new connections.
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Maximum connections reached.
    #[error("Maximum connections reached ({0})")]
    Full(usize),
}

/// Thread-safe map from connection id to connection.
pub struct Registry {
    /// Live connections indexed by id.
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Soft cap on live connections.
    max_connections: usize,
    /// Set once shutdown begins.
    shutting_down: AtomicBool,
}

impl Registry {
    /// Create a registry with no connection limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_limit(usize::MAX)
    }

    /// Create a registry that refuses registrations past `max_connections`.
    #[must_use]
    pub fn with_capacity_limit(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_connections,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register a new connection around `sink`.
    ///
    /// The connection is inserted fully initialised in [`ConnectionState::Open`]
    /// under a fresh id that does not collide with any live entry.
    ///
    /// # Errors
    ///
    /// Returns an error once shutdown has begun or the limit is reached.
    pub fn register(&self, sink: Box<dyn FrameSink>) -> Result<Registration, RegistryError> {
        if self.is_shutting_down() {
            return Err(RegistryError::ShutdownInProgress);
        }
        if self.connections.len() >= self.max_connections {
            warn!(limit = self.max_connections, "Connection limit reached");
            return Err(RegistryError::Full(self.max_connections));
        }

        loop {
            let id = ConnectionId::generate();
            match self.connections.entry(id.clone()) {
                // A v4 collision with a live id; draw again.
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let connection = Arc::new(Connection::new(id.clone(), sink));
                    let lifecycle = connection.lifecycle();
                    slot.insert(connection);

                    debug!(connection = %id, "Connection registered");
                    return Ok(Registration { id, lifecycle });
                }
            }
        }
    }

    /// Remove a connection and mark it closed.
    ///
    /// Returns the removed connection, or `None` if the id was not
    /// registered. Calling this twice is harmless.
    pub fn unregister(&self, id: &str) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(id)?;
        connection.mark_closed();
        debug!(
            connection = %id,
            open_for_ms = connection.opened_at().elapsed().as_millis() as u64,
            "Connection unregistered"
        );
        Some(connection)
    }

    /// Look up a live connection.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ask a live connection to close (`Open -> Closing`).
    ///
    /// Returns `false` if the id is unknown or the connection was not open.
    pub fn request_close(&self, id: &str) -> bool {
        match self.lookup(id) {
            Some(connection) => {
                let changed = connection.request_close();
                if changed {
                    debug!(connection = %id, "Close requested");
                }
                changed
            }
            None => false,
        }
    }

    /// Point-in-time view of every registered connection.
    ///
    /// Shard locks are only held while copying the handles out; no lock is
    /// held while the caller delivers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Get all registered ids.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Refuse all further registrations.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!(connections = self.len(), "Registry closed to new connections");
        }
    }

    /// Check if shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Remove and close every connection. Returns how many were removed.
    pub fn drain(&self) -> usize {
        self.ids()
            .iter()
            .filter(|id| self.unregister(id.as_str()).is_some())
            .count()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.connections.iter() {
            stats.connections += 1;
            match entry.value().state() {
                ConnectionState::Open => stats.open += 1,
                ConnectionState::Closing => stats.closing += 1,
                ConnectionState::Closed => {}
            }
        }
        stats
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered connections.
    pub connections: usize,
    /// Connections in `Open`.
    pub open: usize,
    /// Connections in `Closing`.
    pub closing: usize,
}

//! Connection registry
//!
//! One bounded map from [`ConnectionKey`] to [`Connection`], shared by every
//! engine of a group. The map has its own lock and every connection has
//! another. Lock order is registry then connection; code holding a
//! connection lock never takes the registry lock.

use super::connection::{Connection, ConnectionKey};
use super::lock;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Shared handle to a tracked connection
pub type ConnectionRef = Arc<Mutex<Connection>>;

/// Default upper bound on tracked connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 65536;

/// Bounded flow table
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionKey, ConnectionRef>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    /// Return the connection for `key`, inserting an empty one on miss.
    ///
    /// Fails with [`Error::CapacityExceeded`] when the key is new and the
    /// table is full.
    pub fn lookup_or_create(&self, key: ConnectionKey) -> Result<ConnectionRef> {
        let mut connections = lock(&self.connections);
        if let Some(conn) = connections.get(&key) {
            return Ok(Arc::clone(conn));
        }
        if connections.len() >= self.max_connections {
            return Err(Error::CapacityExceeded {
                max: self.max_connections,
            });
        }

        let conn = Arc::new(Mutex::new(Connection::new(key.protocol)));
        connections.insert(key, Arc::clone(&conn));
        debug!(%key, total = connections.len(), "connection created");
        Ok(conn)
    }

    /// Run `f` on the live connection for `key`, creating it if needed.
    ///
    /// A connection removed between lookup and lock is detached; the key is
    /// looked up again so the write lands on the live entry.
    pub fn with_connection<R>(
        &self,
        key: ConnectionKey,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Result<R> {
        loop {
            let conn = self.lookup_or_create(key)?;
            let mut guard = lock(&conn);
            if guard.is_detached() {
                continue;
            }
            return Ok(f(&mut guard));
        }
    }

    /// Lookup without insert
    pub fn get(&self, key: &ConnectionKey) -> Option<ConnectionRef> {
        lock(&self.connections).get(key).cloned()
    }

    /// Remove a connection and release its queued records.
    ///
    /// Returns the number of records dropped, or `None` if the key was not
    /// tracked.
    pub fn remove(&self, key: &ConnectionKey) -> Option<usize> {
        let conn = lock(&self.connections).remove(key)?;
        let released = lock(&conn).detach();
        debug!(%key, released, "connection removed");
        Some(released)
    }

    /// Evict idle connections not seen for `max_idle`, and every idle
    /// connection whose protocol close has been matched.
    ///
    /// Returns how many were evicted.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut connections = lock(&self.connections);
        let before = connections.len();

        connections.retain(|_, conn| {
            let mut guard = lock(conn);
            let expired = (guard.is_idle() && now.duration_since(guard.last_seen()) > max_idle)
                || guard.is_closed();
            if expired {
                guard.detach();
            }
            !expired
        });

        let expired = before - connections.len();
        if expired > 0 {
            debug!(expired, remaining = connections.len(), "expired idle connections");
        }
        expired
    }

    /// True when every connection is Idle: nothing queued, nothing being
    /// compared, nothing diverged.
    pub fn is_quiescent(&self) -> bool {
        lock(&self.connections)
            .values()
            .all(|conn| lock(conn).is_idle())
    }

    /// Copy out every key and handle so callers can visit connections
    /// without holding the registry lock.
    pub fn snapshot(&self) -> Vec<(ConnectionKey, ConnectionRef)> {
        lock(&self.connections)
            .iter()
            .map(|(key, conn)| (*key, Arc::clone(conn)))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS)
    }
}

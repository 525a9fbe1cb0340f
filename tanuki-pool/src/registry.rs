//! Live connection registry.
//!
//! Tracks every accepted connection for the admission controller's
//! capacity gate, gives the server a way to message or shed miners, and
//! surfaces per-connection state (worker, ban deadline, counters) to
//! operator logging.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{:08x}", self.0)
    }
}

/// Out-of-band instructions to a connection actor.
#[derive(Debug)]
pub enum ConnControl {
    ShowMessage(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnEntry {
    pub peer: SocketAddr,
    pub worker: Option<String>,
    pub banned_until: Option<Instant>,
    pub connected_at: Instant,
    pub control: mpsc::Sender<ConnControl>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnEntry>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection; the returned guard deregisters on drop.
    pub fn register(
        self: &Arc<Self>,
        peer: SocketAddr,
        control: mpsc::Sender<ConnControl>,
    ) -> RegistryGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.write().insert(
            id,
            ConnEntry {
                peer,
                worker: None,
                banned_until: None,
                connected_at: Instant::now(),
                control,
            },
        );
        RegistryGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn set_worker(&self, id: ConnectionId, worker: String) {
        if let Some(entry) = self.connections.write().get_mut(&id) {
            entry.worker = Some(worker);
        }
    }

    pub fn set_banned(&self, id: ConnectionId, until: Instant) {
        if let Some(entry) = self.connections.write().get_mut(&id) {
            entry.banned_until = Some(until);
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnEntry> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot the control senders, for broadcasts and shedding.
    pub fn controls(&self) -> Vec<(ConnectionId, mpsc::Sender<ConnControl>)> {
        self.connections
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.control.clone()))
            .collect()
    }

    fn deregister(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
    }
}

/// Keeps the registry entry alive for the connection's lifetime.
pub struct RegistryGuard {
    registry: Arc<ConnectionRegistry>,
    pub id: ConnectionId,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

//! Worker connection records and the id-keyed registry that owns them.
//!
//! The dispatcher and routing table reference connections only by
//! [`ConnectionId`], resolving to the live record on demand — there are no
//! mutual ownership pointers between the dispatcher and connections.
//!
//! Each connection's outbound side is a single channel sender, so writes
//! back to a worker are serialized per-connection and preserve per-sender
//! FIFO ordering.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::RouterFrame;

/// Opaque handle for one worker connection. Ids are monotonic within a
/// mesh instance; a higher id means a more recent connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a worker connection.
///
/// `Connecting → Registered` on receipt of the capability handshake,
/// `Registered → Active` once eligible for routing, `Active → Draining` on
/// graceful shutdown. Any state can fall to the terminal `Disconnected` on
/// stream close, explicit disconnect, or missed-heartbeat timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Registered,
    Active,
    Draining,
    Disconnected,
}

impl ConnectionState {
    /// Whether envelopes may still be forwarded to this connection.
    /// Draining connections keep serving their existing bindings.
    pub fn can_route(&self) -> bool {
        matches!(self, Self::Active | Self::Draining)
    }

    /// Whether new agent bindings may be assigned to this connection.
    pub fn accepts_new_bindings(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Router-side record of one connected worker.
#[derive(Debug)]
pub struct WorkerConnection {
    pub id: ConnectionId,
    pub state: ConnectionState,
    /// Agent types this worker advertised in its handshake.
    pub agent_types: HashSet<String>,
    /// Per-connection FIFO write path back to the worker.
    pub outbound: mpsc::UnboundedSender<RouterFrame>,
    /// Last observed liveness signal or traffic.
    pub last_seen: Instant,
    pub connected_at: Instant,
}

impl WorkerConnection {
    fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<RouterFrame>) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnectionState::Connecting,
            agent_types: HashSet::new(),
            outbound,
            last_seen: now,
            connected_at: now,
        }
    }

    /// Queue a frame on the write path. Returns `false` when the worker's
    /// receive side is gone (stream torn down).
    pub fn forward(&self, frame: RouterFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Id-keyed registry of live worker connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: u64,
    connections: HashMap<ConnectionId, WorkerConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection in the `Connecting` state.
    pub fn insert(&mut self, outbound: mpsc::UnboundedSender<RouterFrame>) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(id, WorkerConnection::new(id, outbound));
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&WorkerConnection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut WorkerConnection> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<WorkerConnection> {
        self.connections.remove(&id)
    }

    /// Record liveness traffic on a connection.
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Connections with no observed traffic within `timeout`.
    pub fn stale_ids(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.state != ConnectionState::Disconnected)
            .filter(|c| now.duration_since(c.last_seen) > timeout)
            .map(|c| c.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

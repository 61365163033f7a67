//! Outstanding request/response correlations with deadlines.
//!
//! The table guarantees at-most-one resolution per correlation id: entries
//! are removed on fulfillment, expiry, or target disconnect, and whichever
//! path removes the entry first wins. Owned exclusively by the dispatcher
//! loop.

use std::collections::HashMap;
use std::time::Instant;

use crate::connection::ConnectionId;
use crate::types::CorrelationId;

/// One outstanding call awaiting its Response.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Connection that issued the Request and receives the Response.
    pub requester: ConnectionId,
    /// Connection the Request was forwarded to.
    pub target: ConnectionId,
    pub deadline: Instant,
}

/// Tracks outstanding request/response correlations.
#[derive(Debug, Default)]
pub struct PendingCallTable {
    calls: HashMap<CorrelationId, PendingCall>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding call. Returns `false` (and stores nothing)
    /// when the correlation id is already outstanding — ids are reused only
    /// after expiry or fulfillment removes the prior entry.
    pub fn register(&mut self, correlation_id: CorrelationId, call: PendingCall) -> bool {
        if self.calls.contains_key(&correlation_id) {
            return false;
        }
        self.calls.insert(correlation_id, call);
        true
    }

    /// Remove and return the stored waiter. `None` means the id is absent
    /// or already resolved; callers log-and-drop in that case.
    pub fn fulfill(&mut self, correlation_id: &CorrelationId) -> Option<PendingCall> {
        self.calls.remove(correlation_id)
    }

    /// Remove every entry past its deadline, returning them for timeout
    /// resolution.
    pub fn expire_older_than(&mut self, now: Instant) -> Vec<(CorrelationId, PendingCall)> {
        let expired: Vec<CorrelationId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.calls.remove(&id).map(|call| (id, call)))
            .collect()
    }

    /// Remove every call forwarded to `conn`, returning them for
    /// connection-lost resolution.
    pub fn remove_for_target(&mut self, conn: ConnectionId) -> Vec<(CorrelationId, PendingCall)> {
        let ids: Vec<CorrelationId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.target == conn)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.calls.remove(&id).map(|call| (id, call)))
            .collect()
    }

    /// Drop every call issued by `conn` — the requester is gone, so there
    /// is nobody left to notify. Returns how many were dropped.
    pub fn remove_for_requester(&mut self, conn: ConnectionId) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, call| call.requester != conn);
        before - self.calls.len()
    }

    /// Calls currently awaiting a response from `conn` — the load metric
    /// used by the assignment tie-break.
    pub fn count_for_target(&self, conn: ConnectionId) -> usize {
        self.calls.values().filter(|c| c.target == conn).count()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

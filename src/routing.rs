//! Sticky ownership of agent instances and the capability index.
//!
//! The table maps each [`AgentId`] to the worker currently hosting it, and
//! each agent type to the set of workers capable of hosting it. It is owned
//! exclusively by the dispatcher loop, so binding a previously-unbound id is
//! atomic with respect to concurrent requests — the first bind wins and
//! later requests resolve to the established owner.

use std::collections::{BTreeSet, HashMap};

use crate::connection::ConnectionId;
use crate::errors::CallError;
use crate::types::AgentId;

/// Maps agent identity to the owning worker and agent type to candidates.
#[derive(Debug, Default)]
pub struct RoutingTable {
    owners: HashMap<AgentId, ConnectionId>,
    by_type: HashMap<String, BTreeSet<ConnectionId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The worker currently owning `agent_id`, if any.
    pub fn resolve_owner(&self, agent_id: &AgentId) -> Option<ConnectionId> {
        self.owners.get(agent_id).copied()
    }

    /// Establish or confirm sticky ownership. Fails only when a different
    /// live owner already holds the binding; rebinding after the prior
    /// owner's [`release`](Self::release) is an ordinary fresh assignment.
    pub fn bind(&mut self, agent_id: AgentId, conn: ConnectionId) -> Result<(), CallError> {
        match self.owners.get(&agent_id) {
            Some(owner) if *owner == conn => Ok(()),
            Some(_) => Err(CallError::DuplicateRegistration { agent_id }),
            None => {
                self.owners.insert(agent_id, conn);
                Ok(())
            }
        }
    }

    /// Clear every binding owned by `conn`, returning the released ids.
    pub fn release(&mut self, conn: ConnectionId) -> Vec<AgentId> {
        let released: Vec<AgentId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == conn)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &released {
            self.owners.remove(id);
        }
        released
    }

    /// Record the agent types a worker advertised.
    pub fn register_types<I, S>(&mut self, conn: ConnectionId, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for t in types {
            self.by_type.entry(t.into()).or_default().insert(conn);
        }
    }

    /// Drop a worker from the capability index.
    pub fn deregister(&mut self, conn: ConnectionId) {
        self.by_type.retain(|_, conns| {
            conns.remove(&conn);
            !conns.is_empty()
        });
    }

    /// Live workers advertising `agent_type`, in id order.
    pub fn candidates_for(&self, agent_type: &str) -> Vec<ConnectionId> {
        self.by_type
            .get(agent_type)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of currently-bound agent instances.
    pub fn bound_count(&self) -> usize {
        self.owners.len()
    }
}

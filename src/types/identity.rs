//! Identity value types used as routing keys throughout the mesh.
//!
//! Every type here is `Serialize + Deserialize + Debug + Clone` with
//! structural equality and hashing — they are pure data contracts used as
//! map keys by the routing table, subscription registry, and worker clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Names a class of agents a worker can instantiate on demand.
///
/// Multiple workers may advertise the same type; the router picks one per
/// [`AgentId`] on first use (sticky routing).
pub type AgentType = String;

/// Identifies one logical, stateful agent instance.
///
/// Unique system-wide: two requests carrying the same `AgentId` reach the
/// same worker while that worker is alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    /// The class of agent, matched against worker capability advertisements.
    pub agent_type: String,
    /// Distinguishes instances within an agent type.
    pub key: String,
}

impl AgentId {
    pub fn new(agent_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            key: key.into(),
        }
    }

    /// Parse from the canonical `"type/key"` form. The first `/` separates
    /// type from key; the key itself may contain further slashes.
    pub fn parse(s: &str) -> Option<Self> {
        let (agent_type, key) = s.split_once('/')?;
        if agent_type.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(agent_type, key))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_type, self.key)
    }
}

/// Identifies a broadcast channel instance.
///
/// `topic_type` names the kind of event; `source` names the emitting
/// context and can be mapped onto an [`AgentId::key`] by a subscription's
/// key-derivation rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId {
    pub topic_type: String,
    pub source: String,
}

impl TopicId {
    pub fn new(topic_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            topic_type: topic_type.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_type, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn agent_id_display_and_parse() {
        let id = AgentId::new("echo", "1");
        assert_eq!(id.to_string(), "echo/1");
        assert_eq!(AgentId::parse("echo/1"), Some(id));
    }

    #[test]
    fn agent_id_parse_keeps_slashes_in_key() {
        let id = AgentId::parse("scraper/feeds/rust").unwrap();
        assert_eq!(id.agent_type, "scraper");
        assert_eq!(id.key, "feeds/rust");
    }

    #[test]
    fn agent_id_parse_rejects_malformed() {
        assert_eq!(AgentId::parse("no-separator"), None);
        assert_eq!(AgentId::parse("/key-only"), None);
        assert_eq!(AgentId::parse("type-only/"), None);
    }

    #[test]
    fn identities_work_as_map_keys() {
        let mut owners: HashMap<AgentId, u64> = HashMap::new();
        owners.insert(AgentId::new("echo", "1"), 7);
        assert_eq!(owners.get(&AgentId::new("echo", "1")), Some(&7));
        assert_eq!(owners.get(&AgentId::new("echo", "2")), None);
    }

    #[test]
    fn topic_id_display() {
        assert_eq!(TopicId::new("news", "x").to_string(), "news/x");
    }
}

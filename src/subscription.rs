//! Topic-match rules and the read-optimized registry that stores them.
//!
//! The registry is queried on every publish and mutated only on worker
//! registration, so it keeps its rules behind a copy-on-write snapshot:
//! reads clone an `Arc`, writes replace the whole vector. Matching is
//! always evaluated against the snapshot taken at publish time —
//! subscriptions added after a publish never retroactively receive it.
//!
//! Subscriptions are recorded per declaring connection: a publish delivers
//! one copy to each connection with at least one matching subscription,
//! and the key-derivation rule selects the per-instance target inside the
//! receiving worker.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::errors::SubscriptionError;
use crate::types::{AgentType, TopicId};

/// How a subscription's pattern is evaluated against a [`TopicId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "match", content = "pattern", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TopicMatcher {
    /// Matches when `topic_type` equals the pattern exactly.
    Exact(String),
    /// Matches when `topic_type` starts with the pattern.
    Prefix(String),
}

impl TopicMatcher {
    fn pattern(&self) -> &str {
        match self {
            Self::Exact(p) | Self::Prefix(p) => p,
        }
    }
}

/// Optional rule mapping `TopicId.source` onto an `AgentId.key`, so a
/// broadcast fans into per-instance sticky delivery inside each receiving
/// worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "rule", content = "key", rename_all = "snake_case")]
#[non_exhaustive]
pub enum KeyRule {
    /// No derived key: the receiving worker delivers to its `"default"`
    /// instance of the agent type.
    None,
    /// The topic source becomes the instance key.
    FromSource,
    /// Every match lands on the same fixed instance key.
    Static(String),
}

impl Default for KeyRule {
    fn default() -> Self {
        Self::FromSource
    }
}

/// Declares that agents of `agent_type` wish to receive events whose
/// [`TopicId`] matches the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub agent_type: AgentType,
    pub matcher: TopicMatcher,
    #[serde(default)]
    pub key_rule: KeyRule,
}

impl Subscription {
    /// Exact topic-type subscription with source-derived instance keys —
    /// the common per-instance fan-in form.
    pub fn exact(agent_type: impl Into<String>, topic_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            matcher: TopicMatcher::Exact(topic_type.into()),
            key_rule: KeyRule::FromSource,
        }
    }

    /// Prefix topic-type subscription with source-derived instance keys.
    pub fn prefix(agent_type: impl Into<String>, topic_prefix: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            matcher: TopicMatcher::Prefix(topic_prefix.into()),
            key_rule: KeyRule::FromSource,
        }
    }

    pub fn with_key_rule(mut self, rule: KeyRule) -> Self {
        self.key_rule = rule;
        self
    }

    /// Reject empty agent types and empty patterns.
    pub fn validate(&self) -> Result<(), SubscriptionError> {
        if self.agent_type.is_empty() {
            return Err(SubscriptionError::Malformed {
                reason: "agent type must not be empty".into(),
            });
        }
        if self.matcher.pattern().is_empty() {
            return Err(SubscriptionError::Malformed {
                reason: "topic pattern must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Whether this subscription's pattern matches the topic.
    pub fn is_match(&self, topic: &TopicId) -> bool {
        match &self.matcher {
            TopicMatcher::Exact(p) => topic.topic_type == *p,
            TopicMatcher::Prefix(p) => topic.topic_type.starts_with(p.as_str()),
        }
    }

    /// The instance key this subscription derives from a matching topic.
    /// [`KeyRule::None`] falls back to the `"default"` instance.
    pub fn derived_key(&self, topic: &TopicId) -> String {
        match &self.key_rule {
            KeyRule::None => "default".to_string(),
            KeyRule::FromSource => topic.source.clone(),
            KeyRule::Static(key) => key.clone(),
        }
    }
}

/// Stores topic-match rules keyed by declaring connection; queried by the
/// dispatcher on every publish, mutated by registration calls.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Arc<Vec<(ConnectionId, Subscription)>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription for a connection. Idempotent: a no-op if the
    /// identical subscription is already recorded for that connection.
    pub fn add(
        &self,
        conn: ConnectionId,
        subscription: Subscription,
    ) -> Result<(), SubscriptionError> {
        subscription.validate()?;
        let mut guard = self.entries.write();
        if guard.iter().any(|(c, s)| *c == conn && *s == subscription) {
            return Ok(());
        }
        let mut next = guard.as_ref().clone();
        next.push((conn, subscription));
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove the identical subscription for a connection, if present.
    pub fn remove(&self, conn: ConnectionId, subscription: &Subscription) {
        let mut guard = self.entries.write();
        if !guard.iter().any(|(c, s)| *c == conn && s == subscription) {
            return;
        }
        let next: Vec<(ConnectionId, Subscription)> = guard
            .iter()
            .filter(|(c, s)| !(*c == conn && s == subscription))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    /// Drop every subscription a connection declared. Called on disconnect.
    pub fn remove_connection(&self, conn: ConnectionId) {
        let mut guard = self.entries.write();
        if !guard.iter().any(|(c, _)| *c == conn) {
            return;
        }
        let next: Vec<(ConnectionId, Subscription)> = guard
            .iter()
            .filter(|(c, _)| *c != conn)
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    /// Connections with at least one subscription matching `topic`, each
    /// listed once — a publish sends one copy per matching connection even
    /// when several of its subscriptions match.
    pub fn matching_connections(&self, topic: &TopicId) -> Vec<ConnectionId> {
        let snapshot = Arc::clone(&self.entries.read());
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut out = Vec::new();
        for (conn, sub) in snapshot.iter() {
            if sub.is_match(topic) && seen.insert(*conn) {
                out.push(*conn);
            }
        }
        out
    }

    /// Evaluate every stored subscription against `topic` and return the
    /// distinct `(agent_type, derived key)` pairs that match, regardless of
    /// declaring connection.
    pub fn matches(&self, topic: &TopicId) -> Vec<(AgentType, String)> {
        let snapshot = Arc::clone(&self.entries.read());
        let mut seen: HashSet<(AgentType, String)> = HashSet::new();
        let mut out = Vec::new();
        for (_, sub) in snapshot.iter() {
            if !sub.is_match(topic) {
                continue;
            }
            let entry = (sub.agent_type.clone(), sub.derived_key(topic));
            if seen.insert(entry.clone()) {
                out.push(entry);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

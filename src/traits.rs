//! Agent-side trait seams: the handling contract and per-type factories.
//!
//! Dynamic dispatch per agent type is a registry of typed factories keyed
//! by the agent-type string — capability lookup, not inheritance. Each
//! factory produces an opaque handler conforming to a single
//! request/event-handling contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{AgentId, TopicId};
use crate::worker::WorkerHandle;

/// Failure raised by an agent handler while processing a request.
///
/// Travels back to the caller as a `handler_fault` response outcome.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for AgentError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for AgentError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Capabilities available to a handler during delivery: its own identity
/// and a handle for issuing nested calls and publishes.
#[derive(Clone)]
pub struct AgentContext {
    agent_id: AgentId,
    handle: WorkerHandle,
}

impl AgentContext {
    pub(crate) fn new(agent_id: AgentId, handle: WorkerHandle) -> Self {
        Self { agent_id, handle }
    }

    /// The identity of the agent instance being delivered to.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Issue a request to another agent, with this agent as the sender.
    pub async fn send(
        &self,
        target: AgentId,
        payload: Value,
        timeout: std::time::Duration,
    ) -> Result<Value, crate::errors::CallError> {
        self.handle
            .send_from(Some(self.agent_id.clone()), target, payload, timeout)
            .await
    }

    /// Publish an event with this agent as the sender.
    pub async fn publish(
        &self,
        topic: TopicId,
        payload: Value,
    ) -> Result<(), crate::errors::MeshError> {
        self.handle
            .publish_from(Some(self.agent_id.clone()), topic, payload)
            .await
    }

    /// The underlying worker handle, for anything beyond send/publish.
    pub fn worker(&self) -> &WorkerHandle {
        &self.handle
    }
}

/// The request/event-handling contract every hosted agent implements.
///
/// One instance exists per [`AgentId`] on the hosting worker, created
/// lazily by the registered [`AgentFactory`] on first delivery.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Handle a direct request and produce the response payload.
    async fn on_request(&self, payload: Value, ctx: &AgentContext) -> Result<Value, AgentError>;

    /// Handle a broadcast event. Default: ignore.
    async fn on_event(&self, _topic: &TopicId, _payload: Value, _ctx: &AgentContext) {}
}

/// Produces handler instances for one agent type.
///
/// Closures `Fn(&AgentId) -> Arc<dyn AgentHandler>` implement this
/// directly, so simple workers can register factories inline.
pub trait AgentFactory: Send + Sync {
    fn create(&self, agent_id: &AgentId) -> Arc<dyn AgentHandler>;
}

impl<F> AgentFactory for F
where
    F: Fn(&AgentId) -> Arc<dyn AgentHandler> + Send + Sync,
{
    fn create(&self, agent_id: &AgentId) -> Arc<dyn AgentHandler> {
        self(agent_id)
    }
}

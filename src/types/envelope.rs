//! The routed unit of communication and the wire frames that carry it.
//!
//! Everything here is serde-serializable with stable tags so frames can
//! cross a language-neutral wire. Map fields use `BTreeMap` (never
//! `HashMap`) to guarantee deterministic serialization.
//!
//! Payloads are opaque [`serde_json::Value`]s — the mesh routes them
//! without interpretation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionId;
use crate::subscription::Subscription;
use crate::types::identity::{AgentId, TopicId};

/// String-keyed metadata carried on every envelope for tracing/propagation.
pub type Metadata = BTreeMap<String, String>;

/// Unique token linking a Request to its eventual Response.
///
/// Reused only after expiry or fulfillment removes the prior pending entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error codes surfaced in Responses.
///
/// The wire projection of [`CallError`](crate::errors::CallError) — routing
/// failures are converted into ordinary Response-shaped outcomes carrying one
/// of these codes, never raised as transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorCode {
    AgentNotFound,
    Timeout,
    Cancelled,
    ConnectionLost,
    DuplicateRegistration,
    BindRefused,
    HandlerFault,
}

/// The uniform result contract delivered to callers: an opaque payload on
/// success, an [`ErrorCode`] plus human-readable message on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallResult {
    Ok(Value),
    Err { code: ErrorCode, message: String },
}

impl CallResult {
    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Err {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// The routed unit of communication: Request, Response, or Event.
///
/// Deadlines travel as a TTL in milliseconds relative to receipt — sender
/// and router clocks are not assumed synchronized. The router converts the
/// TTL to a local monotonic deadline when it registers the pending call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Envelope {
    /// Direct call to a specific addressable agent instance.
    Request {
        correlation_id: CorrelationId,
        /// The issuing agent, when the call originates inside another agent.
        sender: Option<AgentId>,
        target: AgentId,
        payload: Value,
        ttl_ms: u64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: Metadata,
    },
    /// Reply correlated to an outstanding Request.
    Response {
        correlation_id: CorrelationId,
        result: CallResult,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: Metadata,
    },
    /// Fire-and-forget broadcast on a topic; delivery is best-effort.
    Event {
        topic: TopicId,
        sender: Option<AgentId>,
        payload: Value,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: Metadata,
    },
}

/// Frames a worker sends to the router.
///
/// `Hello` must be the first frame on a connection: the worker declares its
/// hosted agent types and initial subscriptions before being marked active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
#[non_exhaustive]
pub enum WorkerFrame {
    Hello {
        agent_types: Vec<String>,
        subscriptions: Vec<Subscription>,
    },
    /// Liveness signal. Any inbound frame also counts as traffic.
    Heartbeat,
    Subscribe {
        subscription: Subscription,
    },
    Unsubscribe {
        subscription: Subscription,
    },
    /// Explicit registration call: bind an agent instance to this worker
    /// ahead of the first Request.
    BindAgent {
        agent_id: AgentId,
    },
    /// Caller withdrew an outstanding Request: the router drops its pending
    /// entry immediately. Advisory only — the remote owner is not told to
    /// stop processing.
    Cancel {
        correlation_id: CorrelationId,
    },
    /// Graceful shutdown: stop accepting new bindings, let in-flight calls
    /// finish up to their deadline.
    Drain,
    /// Explicit disconnect.
    Bye,
    Envelope {
        envelope: Envelope,
    },
}

/// Frames the router sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RouterFrame {
    /// Handshake acknowledgement; the connection is now eligible for routing.
    HelloAck {
        connection_id: ConnectionId,
    },
    /// Outcome of an explicit [`WorkerFrame::BindAgent`] call.
    BindResult {
        agent_id: AgentId,
        error: Option<ErrorCode>,
    },
    Envelope {
        envelope: Envelope,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_serde_shape() {
        let env = Envelope::Request {
            correlation_id: CorrelationId("c-1".into()),
            sender: None,
            target: AgentId::new("echo", "1"),
            payload: json!("hi"),
            ttl_ms: 1000,
            metadata: Metadata::new(),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["kind"], "request");
        assert_eq!(v["target"]["agent_type"], "echo");
        // Empty metadata is omitted from the wire.
        assert!(v.get("metadata").is_none());

        let back: Envelope = serde_json::from_value(v).unwrap();
        match back {
            Envelope::Request { correlation_id, ttl_ms, .. } => {
                assert_eq!(correlation_id.0, "c-1");
                assert_eq!(ttl_ms, 1000);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn response_error_serde_shape() {
        let env = Envelope::Response {
            correlation_id: CorrelationId::generate(),
            result: CallResult::fail(ErrorCode::AgentNotFound, "no worker"),
            metadata: Metadata::new(),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["kind"], "response");
        assert_eq!(v["result"]["status"], "err");
        assert_eq!(v["result"]["value"]["code"], "agent_not_found");
    }

    #[test]
    fn worker_frame_tags() {
        let v = serde_json::to_value(WorkerFrame::Heartbeat).unwrap();
        assert_eq!(v["frame"], "heartbeat");

        let v = serde_json::to_value(WorkerFrame::Envelope {
            envelope: Envelope::Event {
                topic: TopicId::new("news", "x"),
                sender: None,
                payload: json!({}),
                metadata: Metadata::new(),
            },
        })
        .unwrap();
        assert_eq!(v["frame"], "envelope");
        assert_eq!(v["envelope"]["kind"], "event");
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }
}

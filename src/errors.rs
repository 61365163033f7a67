//! Error types for all mesh operations.
//!
//! Routing-level failures ([`CallError`]) are never raised across the wire
//! as protocol errors — the dispatcher converts them into Response-shaped
//! outcomes carrying an [`ErrorCode`](crate::types::ErrorCode), so callers
//! see a uniform result/error contract.

use thiserror::Error;

use crate::types::{AgentId, ErrorCode};

/// Failures surfaced to a caller of `send()` or an explicit bind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CallError {
    /// No live worker advertises the required agent type.
    #[error("no live worker hosts agent type `{agent_type}`")]
    AgentNotFound { agent_type: String },

    /// Deadline elapsed with no Response.
    #[error("call timed out before a response arrived")]
    Timeout,

    /// The caller withdrew the call. Receiver-side advisory only: the remote
    /// owner is not guaranteed to stop processing.
    #[error("call cancelled by the caller")]
    Cancelled,

    /// The owning worker disconnected mid-call.
    #[error("owning worker disconnected before responding")]
    ConnectionLost,

    /// A different live owner already holds the binding.
    #[error("agent `{agent_id}` is already bound to a different live worker")]
    DuplicateRegistration { agent_id: AgentId },

    /// The binding connection is draining or has not completed its
    /// handshake, so it cannot take new bindings.
    #[error("worker connection is not eligible for new bindings")]
    BindRefused,

    /// The remote agent handler ran and failed.
    #[error("agent handler failed: {message}")]
    HandlerFault { message: String },
}

impl CallError {
    /// The wire projection of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AgentNotFound { .. } => ErrorCode::AgentNotFound,
            Self::Timeout => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::ConnectionLost => ErrorCode::ConnectionLost,
            Self::DuplicateRegistration { .. } => ErrorCode::DuplicateRegistration,
            Self::BindRefused => ErrorCode::BindRefused,
            Self::HandlerFault { .. } => ErrorCode::HandlerFault,
        }
    }
}

/// Malformed or contradictory subscription declarations, reported
/// synchronously to the registering caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SubscriptionError {
    #[error("malformed subscription: {reason}")]
    Malformed { reason: String },
}

/// Runtime lifecycle and transport errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MeshError {
    #[error("mesh runtime is not running")]
    NotRunning,

    #[error("mesh runtime is already running")]
    AlreadyRunning,

    #[error("connection to the mesh closed")]
    ConnectionClosed,

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Call(#[from] CallError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_codes_round_trip_the_taxonomy() {
        let cases = [
            (
                CallError::AgentNotFound {
                    agent_type: "echo".into(),
                },
                ErrorCode::AgentNotFound,
            ),
            (CallError::Timeout, ErrorCode::Timeout),
            (CallError::Cancelled, ErrorCode::Cancelled),
            (CallError::ConnectionLost, ErrorCode::ConnectionLost),
            (
                CallError::DuplicateRegistration {
                    agent_id: AgentId::new("echo", "1"),
                },
                ErrorCode::DuplicateRegistration,
            ),
            (CallError::BindRefused, ErrorCode::BindRefused),
            (
                CallError::HandlerFault {
                    message: "boom".into(),
                },
                ErrorCode::HandlerFault,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn display_names_the_agent_type() {
        let err = CallError::AgentNotFound {
            agent_type: "echo".into(),
        };
        assert!(err.to_string().contains("echo"));
    }
}

//! Foundational value types for the mesh: identities, envelopes, and wire
//! frames.
//!
//! Every type here is `Serialize + Deserialize + Debug + Clone`. Map fields
//! use `BTreeMap` (never `HashMap`) to guarantee deterministic
//! serialization. Public enums are `#[non_exhaustive]` so adding variants
//! is never a breaking change for downstream consumers.

pub mod envelope;
pub mod identity;

pub use envelope::{
    CallResult, CorrelationId, Envelope, ErrorCode, Metadata, RouterFrame, WorkerFrame,
};
pub use identity::{AgentId, AgentType, TopicId};

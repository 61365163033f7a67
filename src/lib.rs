//! agent-mesh: an embeddable message-routing runtime for multi-language
//! agent worker processes.
//!
//! Worker processes connect to a [`Mesh`], advertise which agent types they
//! can host, and exchange JSON payloads through two primitives:
//!
//! - **Direct calls** — [`Worker::send`] routes a request to the agent
//!   instance named by an [`AgentId`] (`type/key`). The first call to an
//!   unbound id picks a capable worker and the binding sticks until that
//!   worker disconnects.
//! - **Broadcast** — [`Worker::publish`] fans an event out to every worker
//!   whose [`Subscription`]s match the [`TopicId`], exactly one wire copy
//!   per worker. Each receiving worker derives the target instance key
//!   locally from the subscription's [`KeyRule`].
//!
//! Workers host agents by registering an [`AgentFactory`] per agent type;
//! instances implementing [`AgentHandler`] are created lazily on first
//! delivery.
//!
//! ```no_run
//! use agent_mesh::{AgentHandler, AgentContext, AgentError, AgentId, Mesh};
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AgentHandler for Echo {
//!     async fn on_request(&self, payload: Value, _ctx: &AgentContext)
//!         -> Result<Value, AgentError>
//!     {
//!         Ok(payload)
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mesh = Mesh::new();
//! mesh.start()?;
//!
//! let host = mesh.connect().await?;
//! host.register_agent_type("echo", |_: &AgentId| Arc::new(Echo) as Arc<dyn AgentHandler>);
//! host.activate().await?;
//!
//! let caller = mesh.connect().await?;
//! caller.activate().await?;
//! let reply = caller
//!     .send(AgentId::new("echo", "1"), json!({"hello": true}), Duration::from_secs(5))
//!     .await?;
//! assert_eq!(reply, json!({"hello": true}));
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod dispatcher;
mod errors;
mod pending;
mod routing;
mod runtime;
mod subscription;
mod traits;
mod types;
mod worker;

pub use config::MeshConfig;
pub use connection::ConnectionId;
pub use dispatcher::MeshStats;
pub use errors::{CallError, MeshError, SubscriptionError};
pub use runtime::Mesh;
pub use subscription::{KeyRule, Subscription, TopicMatcher};
pub use traits::{AgentContext, AgentError, AgentFactory, AgentHandler};
pub use types::{
    AgentId, AgentType, CallResult, CorrelationId, Envelope, ErrorCode, Metadata, RouterFrame,
    TopicId, WorkerFrame,
};
pub use worker::{CancelHandle, PendingReply, Worker, WorkerHandle};

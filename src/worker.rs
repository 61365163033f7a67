//! Worker-side client: the upward API agent implementations consume.
//!
//! A [`Worker`] owns one connection to a mesh. Agent factories are
//! registered before [`activate()`](Worker::activate), which performs the
//! capability/subscription handshake and spawns the read loop and heartbeat
//! ticker. Inbound Requests lazily instantiate handlers through the
//! registered factories; inbound Events are fanned into matching local
//! instances by re-evaluating this worker's own subscriptions, so one wire
//! copy can reach several instances.
//!
//! A caller issuing a request suspends its own task, never the connection:
//! replies resolve through a per-call oneshot channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::MeshConfig;
use crate::connection::ConnectionId;
use crate::errors::{CallError, MeshError};
use crate::subscription::Subscription;
use crate::traits::{AgentContext, AgentFactory, AgentHandler};
use crate::types::{
    AgentId, CallResult, CorrelationId, Envelope, ErrorCode, Metadata, RouterFrame, TopicId,
    WorkerFrame,
};

/// State shared between a [`Worker`], its read loop, and every
/// [`WorkerHandle`] clone handed to agent contexts.
struct WorkerShared {
    connection_id: ConnectionId,
    frame_tx: mpsc::Sender<WorkerFrame>,
    config: MeshConfig,
    active: AtomicBool,
    factories: RwLock<HashMap<String, Arc<dyn AgentFactory>>>,
    /// Lazily created handler instances, one per agent id.
    instances: Mutex<HashMap<AgentId, Arc<dyn AgentHandler>>>,
    /// This worker's own subscriptions, used for local event fan-in.
    subscriptions: RwLock<Vec<Subscription>>,
    /// Local waiters for outstanding calls issued by this worker.
    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<CallResult>>>,
    /// Waiters for explicit bind acknowledgements.
    binds: Mutex<HashMap<AgentId, oneshot::Sender<Option<ErrorCode>>>>,
    hello_ack: Mutex<Option<oneshot::Sender<ConnectionId>>>,
}

impl WorkerShared {
    /// Resolve the local waiters after the connection is gone.
    fn fail_pending(&self, message: &str) {
        let waiters: Vec<(CorrelationId, oneshot::Sender<CallResult>)> =
            self.pending.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(CallResult::fail(ErrorCode::ConnectionLost, message));
        }
    }
}

/// A connected worker process: hosts agent instances, subscribes to
/// topics, and issues calls through the mesh.
pub struct Worker {
    shared: Arc<WorkerShared>,
    /// Taken by `activate()`; present only before the read loop starts.
    inbound: Mutex<Option<mpsc::UnboundedReceiver<RouterFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(
        connection_id: ConnectionId,
        frame_tx: mpsc::Sender<WorkerFrame>,
        inbound: mpsc::UnboundedReceiver<RouterFrame>,
        config: MeshConfig,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                connection_id,
                frame_tx,
                config,
                active: AtomicBool::new(false),
                factories: RwLock::new(HashMap::new()),
                instances: Mutex::new(HashMap::new()),
                subscriptions: RwLock::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                binds: Mutex::new(HashMap::new()),
                hello_ack: Mutex::new(None),
            }),
            inbound: Mutex::new(Some(inbound)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// Declare this worker's capability to host `agent_type`.
    ///
    /// Factories registered before [`activate()`](Self::activate) are
    /// advertised in the handshake; the mesh routes matching agent ids to
    /// this worker from then on.
    pub fn register_agent_type(
        &self,
        agent_type: impl Into<String>,
        factory: impl AgentFactory + 'static,
    ) {
        self.shared
            .factories
            .write()
            .insert(agent_type.into(), Arc::new(factory));
    }

    /// Declare interest in a topic pattern. Before activation the
    /// subscription rides along in the handshake; afterwards it is sent as
    /// its own registration frame. Malformed rules fail synchronously.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<(), MeshError> {
        subscription.validate()?;
        {
            let mut subs = self.shared.subscriptions.write();
            if !subs.contains(&subscription) {
                subs.push(subscription.clone());
            }
        }
        if self.shared.active.load(Ordering::SeqCst) {
            self.shared
                .frame_tx
                .send(WorkerFrame::Subscribe { subscription })
                .await
                .map_err(|_| MeshError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Withdraw a previously declared subscription.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), MeshError> {
        self.shared
            .subscriptions
            .write()
            .retain(|s| s != subscription);
        if self.shared.active.load(Ordering::SeqCst) {
            self.shared
                .frame_tx
                .send(WorkerFrame::Unsubscribe {
                    subscription: subscription.clone(),
                })
                .await
                .map_err(|_| MeshError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Perform the handshake and start the read loop and heartbeat ticker.
    /// The worker is eligible for routing once this returns.
    pub async fn activate(&self) -> Result<(), MeshError> {
        let mut inbound = self
            .inbound
            .lock()
            .take()
            .ok_or(MeshError::AlreadyRunning)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.shared.hello_ack.lock() = Some(ack_tx);

        let shared = Arc::clone(&self.shared);
        let read_task = tokio::spawn(async move {
            // Handler tasks abort with the read loop: dropping the set on
            // exit cancels anything still running.
            let mut handlers = JoinSet::new();
            while let Some(frame) = inbound.recv().await {
                handle_router_frame(&shared, frame, &mut handlers);
            }
            shared.active.store(false, Ordering::SeqCst);
            shared.fail_pending("connection to the mesh closed");
            handlers.abort_all();
        });

        let heartbeat_task = {
            let frame_tx = self.shared.frame_tx.clone();
            let interval = self.shared.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if frame_tx.send(WorkerFrame::Heartbeat).await.is_err() {
                        break;
                    }
                }
            })
        };
        self.tasks.lock().extend([read_task, heartbeat_task]);

        let (agent_types, subscriptions) = {
            let factories = self.shared.factories.read();
            let subs = self.shared.subscriptions.read();
            (factories.keys().cloned().collect(), subs.clone())
        };
        self.shared
            .frame_tx
            .send(WorkerFrame::Hello {
                agent_types,
                subscriptions,
            })
            .await
            .map_err(|_| MeshError::ConnectionClosed)?;

        ack_rx.await.map_err(|_| MeshError::ConnectionClosed)?;
        self.shared.active.store(true, Ordering::SeqCst);
        tracing::debug!(conn = %self.shared.connection_id, "worker active");
        Ok(())
    }

    /// A cloneable handle for issuing calls and publishes, usable from
    /// agent handlers and surrounding application code alike.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocking RPC-style call with an explicit deadline.
    pub async fn send(
        &self,
        target: AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.handle().send(target, payload, timeout).await
    }

    /// Like [`send`](Self::send), using the configured default call timeout.
    pub async fn request(&self, target: AgentId, payload: Value) -> Result<Value, CallError> {
        let timeout = self.shared.config.default_call_timeout;
        self.handle().send(target, payload, timeout).await
    }

    /// Like [`send`](Self::send), but also returns a [`CancelHandle`] for
    /// withdrawing the call while it is awaited.
    pub async fn send_with_cancel(
        &self,
        target: AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<(PendingReply, CancelHandle), MeshError> {
        self.handle().send_with_cancel(target, payload, timeout).await
    }

    /// Fire-and-forget broadcast.
    pub async fn publish(&self, topic: TopicId, payload: Value) -> Result<(), MeshError> {
        self.handle().publish(topic, payload).await
    }

    /// Explicit registration call: claim an agent instance ahead of the
    /// first Request. Fails with
    /// [`CallError::DuplicateRegistration`] when a different live worker
    /// already owns it.
    pub async fn bind_agent(&self, agent_id: AgentId) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.shared.binds.lock().insert(agent_id.clone(), tx);
        if self
            .shared
            .frame_tx
            .send(WorkerFrame::BindAgent {
                agent_id: agent_id.clone(),
            })
            .await
            .is_err()
        {
            self.shared.binds.lock().remove(&agent_id);
            return Err(MeshError::ConnectionClosed);
        }
        match rx.await {
            Ok(None) => Ok(()),
            Ok(Some(ErrorCode::DuplicateRegistration)) => {
                Err(CallError::DuplicateRegistration { agent_id }.into())
            }
            Ok(Some(ErrorCode::BindRefused)) => Err(CallError::BindRefused.into()),
            Ok(Some(_)) => Err(CallError::ConnectionLost.into()),
            Err(_) => Err(MeshError::ConnectionClosed),
        }
    }

    /// Graceful shutdown request: the mesh stops assigning new bindings to
    /// this worker while in-flight calls finish up to their deadline.
    pub async fn drain(&self) -> Result<(), MeshError> {
        self.shared
            .frame_tx
            .send(WorkerFrame::Drain)
            .await
            .map_err(|_| MeshError::ConnectionClosed)
    }

    /// Explicit disconnect: announce departure, stop the background tasks,
    /// and fail any calls still awaiting replies.
    pub async fn close(self) {
        let _ = self.shared.frame_tx.send(WorkerFrame::Bye).await;
        self.shared.active.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.fail_pending("worker closed");
    }
}

/// Cloneable handle over a worker's connection.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// Issue a request and wait for the correlated response or a routing
    /// failure, whichever resolves first.
    pub async fn send(
        &self,
        target: AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.send_from(None, target, payload, timeout).await
    }

    pub(crate) async fn send_from(
        &self,
        sender: Option<AgentId>,
        target: AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let reply = self
            .call_from(sender, target, payload, timeout)
            .await
            .map_err(|_| CallError::ConnectionLost)?;
        reply.await_reply().await
    }

    /// Issue a request and return a [`PendingReply`] the caller can await
    /// or cancel.
    pub async fn call(
        &self,
        target: AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, MeshError> {
        self.call_from(None, target, payload, timeout).await
    }

    pub(crate) async fn call_from(
        &self,
        sender: Option<AgentId>,
        target: AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, MeshError> {
        let correlation_id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(correlation_id.clone(), tx);

        let envelope = Envelope::Request {
            correlation_id: correlation_id.clone(),
            sender,
            target: target.clone(),
            payload,
            ttl_ms: timeout.as_millis() as u64,
            metadata: Metadata::new(),
        };
        if self
            .shared
            .frame_tx
            .send(WorkerFrame::Envelope { envelope })
            .await
            .is_err()
        {
            self.shared.pending.lock().remove(&correlation_id);
            return Err(MeshError::ConnectionClosed);
        }

        Ok(PendingReply {
            correlation_id,
            target,
            timeout,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Issue a request, returning the reply alongside a [`CancelHandle`]
    /// usable from another task while the reply is awaited.
    pub async fn send_with_cancel(
        &self,
        target: AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<(PendingReply, CancelHandle), MeshError> {
        let reply = self.call_from(None, target, payload, timeout).await?;
        let cancel = reply.cancel_handle();
        Ok((reply, cancel))
    }

    /// Fire-and-forget broadcast.
    pub async fn publish(&self, topic: TopicId, payload: Value) -> Result<(), MeshError> {
        self.publish_from(None, topic, payload).await
    }

    pub(crate) async fn publish_from(
        &self,
        sender: Option<AgentId>,
        topic: TopicId,
        payload: Value,
    ) -> Result<(), MeshError> {
        let envelope = Envelope::Event {
            topic,
            sender,
            payload,
            metadata: Metadata::new(),
        };
        self.shared
            .frame_tx
            .send(WorkerFrame::Envelope { envelope })
            .await
            .map_err(|_| MeshError::ConnectionClosed)
    }
}

/// An issued call awaiting its response.
///
/// Cancelling removes the local waiter immediately and resolves the call as
/// withdrawn; the remote owner is not told to stop processing.
pub struct PendingReply {
    correlation_id: CorrelationId,
    target: AgentId,
    timeout: Duration,
    rx: oneshot::Receiver<CallResult>,
    shared: Arc<WorkerShared>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Suspend until the response arrives, the deadline elapses, or the
    /// connection is lost — first resolution wins.
    pub async fn await_reply(self) -> Result<Value, CallError> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => resolve_result(result, &self.target),
            Ok(Err(_)) => Err(CallError::ConnectionLost),
            Err(_) => {
                // Local backstop; the mesh's expiry sweep clears its own
                // entry independently.
                self.shared.pending.lock().remove(&self.correlation_id);
                Err(CallError::Timeout)
            }
        }
    }

    /// A handle for withdrawing this call from another task while the
    /// reply is being awaited.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            correlation_id: self.correlation_id.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Withdraw the call. The local waiter resolves as
    /// [`CallError::Cancelled`] and the mesh drops its pending entry; the
    /// remote owner is not told to stop processing.
    pub async fn cancel(self) {
        cancel_call(&self.shared, &self.correlation_id).await;
    }
}

/// Withdraws an in-flight call while another task awaits the reply.
///
/// Obtained from [`WorkerHandle::send_with_cancel`] or
/// [`PendingReply::cancel_handle`].
#[derive(Clone)]
pub struct CancelHandle {
    correlation_id: CorrelationId,
    shared: Arc<WorkerShared>,
}

impl CancelHandle {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Withdraw the call: the awaiting caller resolves as
    /// [`CallError::Cancelled`] and the mesh drops its pending entry
    /// immediately. A no-op once the call has resolved.
    pub async fn cancel(&self) {
        cancel_call(&self.shared, &self.correlation_id).await;
    }
}

/// Resolve the local waiter as cancelled, then tell the mesh to drop its
/// pending entry so the call stops counting against the owner.
async fn cancel_call(shared: &Arc<WorkerShared>, correlation_id: &CorrelationId) {
    let Some(tx) = shared.pending.lock().remove(correlation_id) else {
        return;
    };
    let _ = tx.send(CallResult::fail(
        ErrorCode::Cancelled,
        "call cancelled by the caller",
    ));
    let _ = shared
        .frame_tx
        .send(WorkerFrame::Cancel {
            correlation_id: correlation_id.clone(),
        })
        .await;
    tracing::debug!(correlation_id = %correlation_id, "call cancelled by caller");
}

/// Map a wire outcome back onto the caller-facing error taxonomy.
fn resolve_result(result: CallResult, target: &AgentId) -> Result<Value, CallError> {
    match result {
        CallResult::Ok(value) => Ok(value),
        CallResult::Err { code, message } => Err(match code {
            ErrorCode::AgentNotFound => CallError::AgentNotFound {
                agent_type: target.agent_type.clone(),
            },
            ErrorCode::Timeout => CallError::Timeout,
            ErrorCode::Cancelled => CallError::Cancelled,
            ErrorCode::ConnectionLost => CallError::ConnectionLost,
            ErrorCode::DuplicateRegistration => CallError::DuplicateRegistration {
                agent_id: target.clone(),
            },
            ErrorCode::BindRefused => CallError::BindRefused,
            ErrorCode::HandlerFault => CallError::HandlerFault { message },
        }),
    }
}

/// Resolve (or lazily create) the handler instance for an agent id.
fn instance_for(shared: &Arc<WorkerShared>, agent_id: &AgentId) -> Option<Arc<dyn AgentHandler>> {
    if let Some(existing) = shared.instances.lock().get(agent_id) {
        return Some(Arc::clone(existing));
    }
    let factory = shared
        .factories
        .read()
        .get(&agent_id.agent_type)
        .map(Arc::clone)?;
    let handler = factory.create(agent_id);
    let mut instances = shared.instances.lock();
    Some(Arc::clone(
        instances.entry(agent_id.clone()).or_insert(handler),
    ))
}

/// Process one frame from the mesh on the worker's read loop.
fn handle_router_frame(
    shared: &Arc<WorkerShared>,
    frame: RouterFrame,
    handlers: &mut JoinSet<()>,
) {
    match frame {
        RouterFrame::HelloAck { connection_id } => {
            if let Some(tx) = shared.hello_ack.lock().take() {
                let _ = tx.send(connection_id);
            }
        }
        RouterFrame::BindResult { agent_id, error } => {
            match shared.binds.lock().remove(&agent_id) {
                Some(tx) => {
                    let _ = tx.send(error);
                }
                None => tracing::debug!(agent_id = %agent_id, "bind result with no waiter"),
            }
        }
        RouterFrame::Envelope { envelope } => match envelope {
            Envelope::Request {
                correlation_id,
                target,
                payload,
                ..
            } => handle_request(shared, correlation_id, target, payload, handlers),
            Envelope::Response {
                correlation_id,
                result,
                ..
            } => match shared.pending.lock().remove(&correlation_id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => {
                    tracing::debug!(correlation_id = %correlation_id, "response with no local waiter")
                }
            },
            Envelope::Event { topic, payload, .. } => {
                handle_event(shared, topic, payload, handlers)
            }
        },
    }
}

fn handle_request(
    shared: &Arc<WorkerShared>,
    correlation_id: CorrelationId,
    target: AgentId,
    payload: Value,
    handlers: &mut JoinSet<()>,
) {
    let frame_tx = shared.frame_tx.clone();
    let Some(handler) = instance_for(shared, &target) else {
        tracing::warn!(agent_id = %target, "request for agent type with no registered factory");
        let result = CallResult::fail(
            ErrorCode::AgentNotFound,
            format!("worker hosts no factory for `{}`", target.agent_type),
        );
        handlers.spawn(async move {
            let _ = frame_tx
                .send(WorkerFrame::Envelope {
                    envelope: Envelope::Response {
                        correlation_id,
                        result,
                        metadata: Metadata::new(),
                    },
                })
                .await;
        });
        return;
    };

    let ctx = AgentContext::new(
        target,
        WorkerHandle {
            shared: Arc::clone(shared),
        },
    );
    handlers.spawn(async move {
        let result = match handler.on_request(payload, &ctx).await {
            Ok(value) => CallResult::Ok(value),
            Err(e) => CallResult::fail(ErrorCode::HandlerFault, e.to_string()),
        };
        let _ = frame_tx
            .send(WorkerFrame::Envelope {
                envelope: Envelope::Response {
                    correlation_id,
                    result,
                    metadata: Metadata::new(),
                },
            })
            .await;
    });
}

/// Local fan-in: one wire copy of an event reaches every matching local
/// instance, de-duplicated by derived agent id.
fn handle_event(
    shared: &Arc<WorkerShared>,
    topic: TopicId,
    payload: Value,
    handlers: &mut JoinSet<()>,
) {
    let subs = shared.subscriptions.read().clone();
    let mut seen: HashSet<AgentId> = HashSet::new();
    for sub in subs {
        if !sub.is_match(&topic) {
            continue;
        }
        let agent_id = AgentId::new(sub.agent_type.clone(), sub.derived_key(&topic));
        if !seen.insert(agent_id.clone()) {
            continue;
        }
        let Some(handler) = instance_for(shared, &agent_id) else {
            tracing::debug!(agent_id = %agent_id, "event for agent type with no registered factory");
            continue;
        };
        let ctx = AgentContext::new(
            agent_id,
            WorkerHandle {
                shared: Arc::clone(shared),
            },
        );
        let topic = topic.clone();
        let payload = payload.clone();
        handlers.spawn(async move {
            handler.on_event(&topic, payload, &ctx).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_outcomes_map_onto_call_errors() {
        let target = AgentId::new("echo", "1");
        assert_eq!(
            resolve_result(CallResult::Ok(json!(1)), &target).unwrap(),
            json!(1)
        );
        assert_eq!(
            resolve_result(
                CallResult::fail(ErrorCode::AgentNotFound, "nope"),
                &target
            )
            .unwrap_err(),
            CallError::AgentNotFound {
                agent_type: "echo".into()
            }
        );
        assert_eq!(
            resolve_result(CallResult::fail(ErrorCode::Timeout, ""), &target).unwrap_err(),
            CallError::Timeout
        );
        assert_eq!(
            resolve_result(CallResult::fail(ErrorCode::Cancelled, ""), &target).unwrap_err(),
            CallError::Cancelled
        );
        assert_eq!(
            resolve_result(CallResult::fail(ErrorCode::BindRefused, ""), &target).unwrap_err(),
            CallError::BindRefused
        );
        assert_eq!(
            resolve_result(
                CallResult::fail(ErrorCode::HandlerFault, "boom"),
                &target
            )
            .unwrap_err(),
            CallError::HandlerFault {
                message: "boom".into()
            }
        );
    }
}

//! The central routing loop.
//!
//! Every connection's read task and the runtime's tickers feed a single
//! command channel consumed by one dispatcher task. The dispatcher owns all
//! cross-connection state (connection registry, routing table, subscription
//! registry, pending-call table) without locks — serializing routing
//! decisions makes bind-before-forward atomic with respect to concurrent
//! requests for the same unbound agent.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::MeshConfig;
use crate::connection::{ConnectionId, ConnectionRegistry, ConnectionState};
use crate::pending::{PendingCall, PendingCallTable};
use crate::routing::RoutingTable;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::types::{AgentId, CallResult, CorrelationId, Envelope, ErrorCode, Metadata, RouterFrame, WorkerFrame};

/// Commands feeding the dispatcher loop.
pub(crate) enum Command {
    /// A new worker stream was accepted; reply carries its connection id.
    Connect {
        outbound: mpsc::UnboundedSender<RouterFrame>,
        reply: oneshot::Sender<ConnectionId>,
    },
    /// A frame arrived on a connection's read path.
    Inbound {
        conn: ConnectionId,
        frame: WorkerFrame,
    },
    /// A connection's read path ended.
    Disconnected { conn: ConnectionId },
    /// Periodic pending-call expiry sweep.
    SweepExpired,
    /// Periodic heartbeat-timeout check.
    CheckLiveness,
    /// Snapshot of dispatcher state for diagnostics.
    Stats { reply: oneshot::Sender<MeshStats> },
    Shutdown,
}

/// Point-in-time counters over the dispatcher's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeshStats {
    pub connections: usize,
    pub pending_calls: usize,
    pub bound_agents: usize,
    pub subscriptions: usize,
}

/// The orchestrating component: classifies inbound envelopes and drives
/// routing, fan-out, and correlation.
pub(crate) struct Dispatcher {
    config: MeshConfig,
    connections: ConnectionRegistry,
    routing: RoutingTable,
    subscriptions: SubscriptionRegistry,
    pending: PendingCallTable,
}

impl Dispatcher {
    pub(crate) fn new(config: MeshConfig) -> Self {
        Self {
            config,
            connections: ConnectionRegistry::new(),
            routing: RoutingTable::new(),
            subscriptions: SubscriptionRegistry::new(),
            pending: PendingCallTable::new(),
        }
    }

    /// Process commands until `Shutdown` or the channel closes.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Connect { outbound, reply } => {
                    let id = self.connections.insert(outbound);
                    tracing::debug!(conn = %id, "worker connection accepted");
                    let _ = reply.send(id);
                }
                Command::Inbound { conn, frame } => self.handle_inbound(conn, frame),
                Command::Disconnected { conn } => self.mark_disconnected(conn, "stream closed"),
                Command::SweepExpired => self.sweep_expired(Instant::now()),
                Command::CheckLiveness => self.check_liveness(Instant::now()),
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Command::Shutdown => {
                    tracing::debug!("dispatcher shutting down");
                    break;
                }
            }
        }
    }

    fn handle_inbound(&mut self, conn: ConnectionId, frame: WorkerFrame) {
        if self.connections.get(conn).is_none() {
            tracing::trace!(conn = %conn, "dropping frame from unknown connection");
            return;
        }
        // Any inbound frame counts as liveness traffic.
        self.connections.touch(conn);

        match frame {
            WorkerFrame::Hello {
                agent_types,
                subscriptions,
            } => self.handle_hello(conn, agent_types, subscriptions),
            WorkerFrame::Heartbeat => {}
            WorkerFrame::Subscribe { subscription } => {
                if let Err(e) = self.subscriptions.add(conn, subscription) {
                    tracing::warn!(conn = %conn, error = %e, "rejected subscription");
                }
            }
            WorkerFrame::Unsubscribe { subscription } => {
                self.subscriptions.remove(conn, &subscription)
            }
            WorkerFrame::BindAgent { agent_id } => self.handle_bind(conn, agent_id),
            WorkerFrame::Cancel { correlation_id } => self.handle_cancel(conn, correlation_id),
            WorkerFrame::Drain => self.handle_drain(conn),
            WorkerFrame::Bye => self.mark_disconnected(conn, "explicit disconnect"),
            WorkerFrame::Envelope { envelope } => match envelope {
                Envelope::Request { .. } => self.handle_request(conn, envelope),
                Envelope::Response { .. } => self.handle_response(conn, envelope),
                Envelope::Event { .. } => self.handle_event(conn, envelope),
            },
        }
    }

    /// Capability/subscription handshake: `Connecting → Registered →
    /// Active`.
    fn handle_hello(
        &mut self,
        conn: ConnectionId,
        agent_types: Vec<String>,
        subscriptions: Vec<Subscription>,
    ) {
        {
            let Some(record) = self.connections.get_mut(conn) else {
                return;
            };
            if record.state != ConnectionState::Connecting {
                tracing::warn!(conn = %conn, "ignoring repeated handshake");
                return;
            }
            record.agent_types = agent_types.iter().cloned().collect();
            record.state = ConnectionState::Registered;
        }
        self.routing.register_types(conn, agent_types);
        for sub in subscriptions {
            if let Err(e) = self.subscriptions.add(conn, sub) {
                tracing::warn!(conn = %conn, error = %e, "rejected handshake subscription");
            }
        }
        if !self.forward(conn, RouterFrame::HelloAck { connection_id: conn }) {
            self.mark_disconnected(conn, "write path closed");
            return;
        }
        if let Some(record) = self.connections.get_mut(conn) {
            record.state = ConnectionState::Active;
            tracing::debug!(conn = %conn, types = ?record.agent_types, "worker active");
        }
    }

    /// Explicit registration call ahead of the first Request.
    fn handle_bind(&mut self, conn: ConnectionId, agent_id: AgentId) {
        let state = self.connections.get(conn).map(|r| r.state);
        let accepts = state.map(|s| s.accepts_new_bindings()).unwrap_or(false);
        let error = if !accepts {
            tracing::warn!(conn = %conn, state = ?state, agent_id = %agent_id, "bind refused: connection takes no new bindings");
            Some(ErrorCode::BindRefused)
        } else {
            match self.routing.bind(agent_id.clone(), conn) {
                Ok(()) => None,
                Err(e) => {
                    tracing::debug!(conn = %conn, agent_id = %agent_id, "bind refused: a live owner exists");
                    Some(e.code())
                }
            }
        };
        if !self.forward(conn, RouterFrame::BindResult { agent_id, error }) {
            self.mark_disconnected(conn, "write path closed");
        }
    }

    /// Caller withdrew a call: drop the pending entry so the correlation id
    /// stops counting against the owner's load. No Response is synthesized —
    /// the caller has already resolved locally as cancelled.
    fn handle_cancel(&mut self, conn: ConnectionId, correlation_id: CorrelationId) {
        match self.pending.fulfill(&correlation_id) {
            Some(_) => {
                tracing::debug!(correlation_id = %correlation_id, conn = %conn, "pending call cancelled by caller")
            }
            None => {
                tracing::debug!(correlation_id = %correlation_id, conn = %conn, "cancel for unknown or resolved call")
            }
        }
    }

    fn handle_drain(&mut self, conn: ConnectionId) {
        if let Some(record) = self.connections.get_mut(conn) {
            if record.state == ConnectionState::Active {
                record.state = ConnectionState::Draining;
                tracing::debug!(conn = %conn, "worker draining");
            }
        }
    }

    /// Resolve or assign the owner, register the pending call, forward.
    fn handle_request(&mut self, from: ConnectionId, envelope: Envelope) {
        let Envelope::Request {
            ref correlation_id,
            ref target,
            ttl_ms,
            ..
        } = envelope
        else {
            return;
        };
        let correlation_id = correlation_id.clone();
        let target = target.clone();

        let owner = self
            .routing
            .resolve_owner(&target)
            .filter(|c| self.is_routable(*c));
        let owner = match owner {
            Some(owner) => owner,
            None => match self.assign_owner(&target) {
                Some(owner) => owner,
                None => {
                    tracing::debug!(agent_id = %target, "no eligible worker for request");
                    self.respond_error(
                        from,
                        correlation_id,
                        ErrorCode::AgentNotFound,
                        format!("no live worker hosts agent type `{}`", target.agent_type),
                    );
                    return;
                }
            },
        };

        let deadline = Instant::now() + Duration::from_millis(ttl_ms);
        let registered = self.pending.register(
            correlation_id.clone(),
            PendingCall {
                requester: from,
                target: owner,
                deadline,
            },
        );
        if !registered {
            tracing::warn!(correlation_id = %correlation_id, conn = %from, "duplicate correlation id, dropping request");
            return;
        }

        if !self.forward(owner, RouterFrame::Envelope { envelope }) {
            // Target torn down between resolution and send: a routing miss,
            // resolved locally instead of forwarded.
            self.pending.fulfill(&correlation_id);
            self.respond_error(
                from,
                correlation_id,
                ErrorCode::ConnectionLost,
                "owning worker disconnected before forwarding",
            );
            self.mark_disconnected(owner, "write path closed");
        }
    }

    /// Correlate with the outstanding call and forward to the requester.
    fn handle_response(&mut self, from: ConnectionId, envelope: Envelope) {
        let Envelope::Response {
            ref correlation_id, ..
        } = envelope
        else {
            return;
        };
        let correlation_id = correlation_id.clone();
        match self.pending.fulfill(&correlation_id) {
            Some(call) => {
                if !self.forward(call.requester, RouterFrame::Envelope { envelope }) {
                    tracing::debug!(
                        correlation_id = %correlation_id,
                        conn = %call.requester,
                        "requester gone before response delivery"
                    );
                    self.mark_disconnected(call.requester, "write path closed");
                }
            }
            None => {
                // Already expired or unknown; the timeout path has resolved
                // the caller.
                tracing::debug!(
                    correlation_id = %correlation_id,
                    conn = %from,
                    "dropping response with no outstanding call"
                );
            }
        }
    }

    /// Fan an event out: one copy to each connection with at least one
    /// matching subscription. The receiving worker derives the per-instance
    /// target from its own subscriptions, so delivery stays sticky within
    /// that worker.
    fn handle_event(&mut self, _from: ConnectionId, envelope: Envelope) {
        let Envelope::Event { ref topic, .. } = envelope else {
            return;
        };
        let topic = topic.clone();
        // Matching runs against the registry snapshot taken now; later
        // subscriptions never receive this publish retroactively.
        let targets: BTreeSet<ConnectionId> = self
            .subscriptions
            .matching_connections(&topic)
            .into_iter()
            .filter(|c| self.is_routable(*c))
            .collect();
        if targets.is_empty() {
            tracing::trace!(topic = %topic, "event matched no live subscriptions");
            return;
        }

        let mut torn_down = Vec::new();
        for target in targets {
            if !self.forward(
                target,
                RouterFrame::Envelope {
                    envelope: envelope.clone(),
                },
            ) {
                // Events are best-effort: dropped for this one target.
                tracing::debug!(topic = %topic, conn = %target, "dropping event for torn-down connection");
                torn_down.push(target);
            }
        }
        for conn in torn_down {
            self.mark_disconnected(conn, "write path closed");
        }
    }

    /// Pick a worker for an unbound agent and bind before forwarding, so
    /// concurrent requests for the same id converge on one winner.
    fn assign_owner(&mut self, agent_id: &AgentId) -> Option<ConnectionId> {
        let candidate = self.select_candidate(&agent_id.agent_type)?;
        match self.routing.bind(agent_id.clone(), candidate) {
            Ok(()) => {
                tracing::debug!(agent_id = %agent_id, conn = %candidate, "bound agent to worker");
                Some(candidate)
            }
            // First bind won; route to the established owner.
            Err(_) => self.routing.resolve_owner(agent_id),
        }
    }

    /// Assignment policy: fewest currently-pending calls, then the most
    /// recent connection.
    fn select_candidate(&self, agent_type: &str) -> Option<ConnectionId> {
        self.routing
            .candidates_for(agent_type)
            .into_iter()
            .filter(|c| {
                self.connections
                    .get(*c)
                    .map(|r| r.state.accepts_new_bindings())
                    .unwrap_or(false)
            })
            .min_by_key(|c| {
                (
                    self.pending.count_for_target(*c),
                    std::cmp::Reverse(c.as_u64()),
                )
            })
    }

    fn is_routable(&self, conn: ConnectionId) -> bool {
        self.connections
            .get(conn)
            .map(|r| r.state.can_route())
            .unwrap_or(false)
    }

    /// Synthesize a Response-shaped outcome back to the requester.
    fn respond_error(
        &mut self,
        to: ConnectionId,
        correlation_id: CorrelationId,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        let envelope = Envelope::Response {
            correlation_id,
            result: CallResult::fail(code, message),
            metadata: Metadata::new(),
        };
        if !self.forward(to, RouterFrame::Envelope { envelope }) {
            tracing::trace!(conn = %to, "requester gone before error delivery");
        }
    }

    fn forward(&self, conn: ConnectionId, frame: RouterFrame) -> bool {
        self.connections
            .get(conn)
            .map(|c| c.forward(frame))
            .unwrap_or(false)
    }

    /// Tear down a connection: release ownerships, fail calls it was
    /// serving, drop calls it was waiting on.
    fn mark_disconnected(&mut self, conn: ConnectionId, reason: &str) {
        {
            let Some(record) = self.connections.get_mut(conn) else {
                return;
            };
            if record.state == ConnectionState::Disconnected {
                return;
            }
            record.state = ConnectionState::Disconnected;
        }
        tracing::debug!(conn = %conn, reason, "worker disconnected");

        let released = self.routing.release(conn);
        if !released.is_empty() {
            tracing::debug!(conn = %conn, count = released.len(), "released agent bindings");
        }
        self.routing.deregister(conn);
        self.subscriptions.remove_connection(conn);

        for (correlation_id, call) in self.pending.remove_for_target(conn) {
            self.respond_error(
                call.requester,
                correlation_id,
                ErrorCode::ConnectionLost,
                "owning worker disconnected mid-call",
            );
        }
        let dropped = self.pending.remove_for_requester(conn);
        if dropped > 0 {
            tracing::debug!(conn = %conn, count = dropped, "dropped pending calls from disconnected requester");
        }
        self.connections.remove(conn);
    }

    fn sweep_expired(&mut self, now: Instant) {
        for (correlation_id, call) in self.pending.expire_older_than(now) {
            tracing::debug!(correlation_id = %correlation_id, "pending call expired");
            self.respond_error(
                call.requester,
                correlation_id,
                ErrorCode::Timeout,
                "deadline elapsed with no response",
            );
        }
    }

    fn check_liveness(&mut self, now: Instant) {
        let timeout = self.config.liveness_timeout();
        for conn in self.connections.stale_ids(now, timeout) {
            self.mark_disconnected(conn, "missed heartbeat");
        }
    }

    fn stats(&self) -> MeshStats {
        MeshStats {
            connections: self.connections.len(),
            pending_calls: self.pending.len(),
            bound_agents: self.routing.bound_count(),
            subscriptions: self.subscriptions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicId;
    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;

    type FrameRx = mpsc::UnboundedReceiver<RouterFrame>;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(MeshConfig::default())
    }

    /// Accept a connection and complete its handshake.
    fn connect(
        d: &mut Dispatcher,
        agent_types: &[&str],
        subscriptions: Vec<Subscription>,
    ) -> (ConnectionId, FrameRx) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = d.connections.insert(tx);
        d.handle_inbound(
            conn,
            WorkerFrame::Hello {
                agent_types: agent_types.iter().map(|s| s.to_string()).collect(),
                subscriptions,
            },
        );
        match rx.try_recv() {
            Ok(RouterFrame::HelloAck { connection_id }) => assert_eq!(connection_id, conn),
            other => panic!("expected HelloAck, got {other:?}"),
        }
        (conn, rx)
    }

    fn request(d: &mut Dispatcher, from: ConnectionId, target: AgentId, ttl_ms: u64) -> CorrelationId {
        let correlation_id = CorrelationId::generate();
        d.handle_inbound(
            from,
            WorkerFrame::Envelope {
                envelope: Envelope::Request {
                    correlation_id: correlation_id.clone(),
                    sender: None,
                    target,
                    payload: json!("hi"),
                    ttl_ms,
                    metadata: Metadata::new(),
                },
            },
        );
        correlation_id
    }

    fn publish(d: &mut Dispatcher, from: ConnectionId, topic: TopicId) {
        d.handle_inbound(
            from,
            WorkerFrame::Envelope {
                envelope: Envelope::Event {
                    topic,
                    sender: None,
                    payload: json!({"n": 1}),
                    metadata: Metadata::new(),
                },
            },
        );
    }

    fn recv_envelope(rx: &mut FrameRx) -> Envelope {
        match rx.try_recv() {
            Ok(RouterFrame::Envelope { envelope }) => envelope,
            other => panic!("expected envelope frame, got {other:?}"),
        }
    }

    fn expect_error_response(rx: &mut FrameRx, code: ErrorCode) -> CorrelationId {
        match recv_envelope(rx) {
            Envelope::Response {
                correlation_id,
                result: CallResult::Err { code: got, .. },
                ..
            } => {
                assert_eq!(got, code);
                correlation_id
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn request_binds_forwards_and_correlates() {
        let mut d = dispatcher();
        let (worker, mut worker_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, mut client_rx) = connect(&mut d, &[], vec![]);

        let cid = request(&mut d, client, AgentId::new("echo", "1"), 1000);
        assert_eq!(d.stats().pending_calls, 1);
        assert_eq!(d.routing.resolve_owner(&AgentId::new("echo", "1")), Some(worker));

        // The worker received the forwarded request.
        match recv_envelope(&mut worker_rx) {
            Envelope::Request { correlation_id, .. } => assert_eq!(correlation_id, cid),
            other => panic!("expected request, got {other:?}"),
        }

        // Worker answers; client receives the correlated response.
        d.handle_inbound(
            worker,
            WorkerFrame::Envelope {
                envelope: Envelope::Response {
                    correlation_id: cid.clone(),
                    result: CallResult::Ok(json!("hi")),
                    metadata: Metadata::new(),
                },
            },
        );
        match recv_envelope(&mut client_rx) {
            Envelope::Response {
                correlation_id,
                result,
                ..
            } => {
                assert_eq!(correlation_id, cid);
                assert!(result.is_ok());
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert_eq!(d.stats().pending_calls, 0);
    }

    #[test]
    fn missing_agent_type_yields_agent_not_found_without_pending_entry() {
        let mut d = dispatcher();
        let (client, mut client_rx) = connect(&mut d, &[], vec![]);

        request(&mut d, client, AgentId::new("echo", "1"), 1000);
        expect_error_response(&mut client_rx, ErrorCode::AgentNotFound);
        assert_eq!(d.stats().pending_calls, 0);
        assert_eq!(d.stats().bound_agents, 0);
    }

    #[test]
    fn sticky_routing_reuses_the_first_owner() {
        let mut d = dispatcher();
        let (_w1, mut w1_rx) = connect(&mut d, &["echo"], vec![]);
        let (_w2, mut w2_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, _client_rx) = connect(&mut d, &[], vec![]);

        // Equal load: assignment prefers the most recent connection (w2).
        request(&mut d, client, AgentId::new("echo", "1"), 1000);
        request(&mut d, client, AgentId::new("echo", "1"), 1000);

        assert!(matches!(recv_envelope(&mut w2_rx), Envelope::Request { .. }));
        assert!(matches!(recv_envelope(&mut w2_rx), Envelope::Request { .. }));
        assert!(matches!(w1_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn assignment_prefers_least_loaded_worker() {
        let mut d = dispatcher();
        let (_w1, mut w1_rx) = connect(&mut d, &["echo"], vec![]);
        let (_w2, mut w2_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, _client_rx) = connect(&mut d, &[], vec![]);

        // First call lands on w2 (recency tie-break) and stays pending.
        request(&mut d, client, AgentId::new("echo", "1"), 1000);
        assert!(matches!(recv_envelope(&mut w2_rx), Envelope::Request { .. }));

        // A different agent now assigns to the less-loaded w1.
        request(&mut d, client, AgentId::new("echo", "2"), 1000);
        assert!(matches!(recv_envelope(&mut w1_rx), Envelope::Request { .. }));
    }

    #[test]
    fn draining_worker_keeps_bindings_but_takes_no_new_ones() {
        let mut d = dispatcher();
        let (worker, mut worker_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, mut client_rx) = connect(&mut d, &[], vec![]);

        request(&mut d, client, AgentId::new("echo", "1"), 1000);
        assert!(matches!(recv_envelope(&mut worker_rx), Envelope::Request { .. }));

        d.handle_inbound(worker, WorkerFrame::Drain);

        // Sticky delivery to the existing binding still works.
        request(&mut d, client, AgentId::new("echo", "1"), 1000);
        assert!(matches!(recv_envelope(&mut worker_rx), Envelope::Request { .. }));

        // A fresh binding finds no eligible candidate.
        request(&mut d, client, AgentId::new("echo", "2"), 1000);
        expect_error_response(&mut client_rx, ErrorCode::AgentNotFound);
    }

    #[test]
    fn event_fans_out_once_per_connection() {
        let mut d = dispatcher();
        // Two subscriptions on the same worker that both match the topic.
        let subs = vec![
            Subscription::exact("listener", "news"),
            Subscription::prefix("listener", "ne"),
        ];
        let (_worker, mut worker_rx) = connect(&mut d, &["listener"], subs);
        let (client, _client_rx) = connect(&mut d, &[], vec![]);

        publish(&mut d, client, TopicId::new("news", "x"));

        assert!(matches!(recv_envelope(&mut worker_rx), Envelope::Event { .. }));
        assert!(matches!(worker_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn event_reaches_every_matching_worker() {
        let mut d = dispatcher();
        let (_a, mut a_rx) = connect(
            &mut d,
            &["listener"],
            vec![Subscription::exact("listener", "news")],
        );
        let (_b, mut b_rx) = connect(
            &mut d,
            &["listener"],
            vec![Subscription::exact("listener", "news")],
        );
        let (client, _client_rx) = connect(&mut d, &[], vec![]);

        publish(&mut d, client, TopicId::new("news", "x"));

        // Exactly one copy to each subscribed worker.
        assert!(matches!(recv_envelope(&mut a_rx), Envelope::Event { .. }));
        assert!(matches!(a_rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(recv_envelope(&mut b_rx), Envelope::Event { .. }));
        assert!(matches!(b_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn unsubscribed_topic_is_dropped() {
        let mut d = dispatcher();
        let (_worker, mut worker_rx) = connect(
            &mut d,
            &["listener"],
            vec![Subscription::exact("listener", "news")],
        );
        let (client, _client_rx) = connect(&mut d, &[], vec![]);

        publish(&mut d, client, TopicId::new("weather", "x"));
        assert!(matches!(worker_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn disconnect_fails_inflight_calls_and_releases_bindings() {
        let mut d = dispatcher();
        let (worker, mut worker_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, mut client_rx) = connect(&mut d, &[], vec![]);

        let cid = request(&mut d, client, AgentId::new("echo", "1"), 60_000);
        assert!(matches!(recv_envelope(&mut worker_rx), Envelope::Request { .. }));

        d.handle_inbound(worker, WorkerFrame::Bye);

        let got = expect_error_response(&mut client_rx, ErrorCode::ConnectionLost);
        assert_eq!(got, cid);
        assert_eq!(d.stats().pending_calls, 0);
        assert_eq!(d.stats().bound_agents, 0);
        assert_eq!(d.stats().connections, 1);

        // A late response from the dead worker is dropped silently.
        d.handle_inbound(
            worker,
            WorkerFrame::Envelope {
                envelope: Envelope::Response {
                    correlation_id: cid,
                    result: CallResult::Ok(json!("late")),
                    metadata: Metadata::new(),
                },
            },
        );
        assert!(matches!(client_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn rebind_after_owner_disconnect_lands_on_surviving_worker() {
        let mut d = dispatcher();
        let (w1, mut w1_rx) = connect(&mut d, &["echo"], vec![]);
        let (_w2, mut w2_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, _client_rx) = connect(&mut d, &[], vec![]);

        // w2 wins the first assignment (recency); disconnect it.
        request(&mut d, client, AgentId::new("echo", "1"), 1000);
        assert!(matches!(recv_envelope(&mut w2_rx), Envelope::Request { .. }));
        let w2 = d.routing.resolve_owner(&AgentId::new("echo", "1")).unwrap();
        assert_ne!(w2, w1);
        d.handle_inbound(w2, WorkerFrame::Bye);

        // The next request reassigns to the survivor without an error.
        request(&mut d, client, AgentId::new("echo", "1"), 1000);
        assert_eq!(d.routing.resolve_owner(&AgentId::new("echo", "1")), Some(w1));
        assert!(matches!(recv_envelope(&mut w1_rx), Envelope::Request { .. }));
    }

    #[test]
    fn expiry_sweep_resolves_timeout_and_empties_the_table() {
        let mut d = dispatcher();
        let (_worker, mut worker_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, mut client_rx) = connect(&mut d, &[], vec![]);

        let cid = request(&mut d, client, AgentId::new("echo", "1"), 0);
        assert!(matches!(recv_envelope(&mut worker_rx), Envelope::Request { .. }));
        assert_eq!(d.stats().pending_calls, 1);

        d.sweep_expired(Instant::now() + Duration::from_millis(1));

        let got = expect_error_response(&mut client_rx, ErrorCode::Timeout);
        assert_eq!(got, cid);
        assert_eq!(d.stats().pending_calls, 0);
    }

    #[test]
    fn explicit_bind_conflicts_surface_duplicate_registration() {
        let mut d = dispatcher();
        let (a, mut a_rx) = connect(&mut d, &["echo"], vec![]);
        let (b, mut b_rx) = connect(&mut d, &["echo"], vec![]);

        d.handle_inbound(a, WorkerFrame::BindAgent { agent_id: AgentId::new("echo", "1") });
        match a_rx.try_recv() {
            Ok(RouterFrame::BindResult { error: None, .. }) => {}
            other => panic!("expected successful bind, got {other:?}"),
        }

        d.handle_inbound(b, WorkerFrame::BindAgent { agent_id: AgentId::new("echo", "1") });
        match b_rx.try_recv() {
            Ok(RouterFrame::BindResult {
                error: Some(ErrorCode::DuplicateRegistration),
                ..
            }) => {}
            other => panic!("expected duplicate registration, got {other:?}"),
        }
    }

    #[test]
    fn bind_from_draining_connection_is_refused_not_lost() {
        let mut d = dispatcher();
        let (worker, mut worker_rx) = connect(&mut d, &["echo"], vec![]);

        d.handle_inbound(worker, WorkerFrame::Drain);
        d.handle_inbound(worker, WorkerFrame::BindAgent { agent_id: AgentId::new("echo", "1") });
        match worker_rx.try_recv() {
            Ok(RouterFrame::BindResult {
                error: Some(ErrorCode::BindRefused),
                ..
            }) => {}
            other => panic!("expected refused bind, got {other:?}"),
        }
        // The connection itself is still live and routable.
        assert_eq!(d.stats().connections, 1);
        assert_eq!(d.stats().bound_agents, 0);
    }

    #[test]
    fn cancel_frame_clears_the_pending_entry_without_a_response() {
        let mut d = dispatcher();
        let (worker, mut worker_rx) = connect(&mut d, &["echo"], vec![]);
        let (client, mut client_rx) = connect(&mut d, &[], vec![]);

        let cid = request(&mut d, client, AgentId::new("echo", "1"), 60_000);
        assert!(matches!(recv_envelope(&mut worker_rx), Envelope::Request { .. }));
        assert_eq!(d.stats().pending_calls, 1);
        assert_eq!(d.pending.count_for_target(worker), 1);

        d.handle_inbound(client, WorkerFrame::Cancel { correlation_id: cid.clone() });
        assert_eq!(d.stats().pending_calls, 0);
        // The owner's load metric no longer counts the withdrawn call.
        assert_eq!(d.pending.count_for_target(worker), 0);
        // The caller resolved locally; nothing is echoed back.
        assert!(matches!(client_rx.try_recv(), Err(TryRecvError::Empty)));

        // A late response from the worker is dropped silently.
        d.handle_inbound(
            worker,
            WorkerFrame::Envelope {
                envelope: Envelope::Response {
                    correlation_id: cid,
                    result: CallResult::Ok(json!("late")),
                    metadata: Metadata::new(),
                },
            },
        );
        assert!(matches!(client_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn silent_connection_is_reaped_by_liveness_check() {
        let mut d = dispatcher();
        let (_conn, _rx) = connect(&mut d, &["echo"], vec![]);
        assert_eq!(d.stats().connections, 1);

        let timeout = d.config.liveness_timeout();
        d.check_liveness(Instant::now() + timeout + Duration::from_secs(1));
        assert_eq!(d.stats().connections, 0);
    }

    #[test]
    fn subscription_added_after_publish_gets_nothing_retroactively() {
        let mut d = dispatcher();
        let (worker, mut worker_rx) = connect(&mut d, &["listener"], vec![]);
        let (client, _client_rx) = connect(&mut d, &[], vec![]);

        publish(&mut d, client, TopicId::new("news", "x"));

        d.handle_inbound(
            worker,
            WorkerFrame::Subscribe {
                subscription: Subscription::exact("listener", "news"),
            },
        );
        assert!(matches!(worker_rx.try_recv(), Err(TryRecvError::Empty)));

        // The next publish is delivered.
        publish(&mut d, client, TopicId::new("news", "x"));
        assert!(matches!(recv_envelope(&mut worker_rx), Envelope::Event { .. }));
    }
}

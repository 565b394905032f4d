//! The agent: a cooperative dispatcher driven by the host's frame loop.
//!
//! Flow per [`Agent::tick`]:
//! 1. Drain transport events (connects, messages, closes) and dispatch requests
//! 2. Route host events to the event waits that subscribed to them
//! 3. Resume pending operations whose wake time has arrived
//!
//! The agent holds no host state and never blocks. Everything it needs from
//! the host is borrowed for the duration of one tick.

pub mod config;
pub mod handlers;
pub mod ops;
pub mod pending;

use std::io;
use std::time::Instant;

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::bridge::protocol::{Response, RpcError, parse_request};
use crate::capabilities;
use crate::host::{EventSink, Host, HostEvent, Subscription, SubscriptionId};
use crate::transport::{self, ConnectionId, Listener, TransportEvent};

pub use config::AgentConfig;
pub use handlers::{Dispatch, HandlerContext, Session};
pub use ops::{Operation, Step};
pub use pending::{PendingKey, PendingTable};

/// Hands out subscription ids bound to the agent's host-event queue.
#[derive(Debug)]
pub(crate) struct Subscriptions {
    next: u64,
    sink: EventSink,
}

impl Subscriptions {
    pub(crate) fn new(tx: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self {
            next: 0,
            sink: EventSink::new(tx),
        }
    }

    pub(crate) fn allocate(&mut self) -> Subscription {
        self.next += 1;
        Subscription::new(SubscriptionId::new(self.next), self.sink.clone())
    }
}

/// The current controller connection.
#[derive(Debug)]
struct Peer {
    connection: ConnectionId,
    outbound: mpsc::UnboundedSender<Response>,
    session: Session,
}

pub struct Agent {
    config: AgentConfig,
    inbox: mpsc::UnboundedReceiver<TransportEvent>,
    peer: Option<Peer>,
    pending: PendingTable,
    subscriptions: Subscriptions,
    host_events: mpsc::UnboundedReceiver<HostEvent>,
}

impl Agent {
    pub fn new(config: AgentConfig, inbox: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        let (events_tx, host_events) = mpsc::unbounded_channel();
        Self {
            config,
            inbox,
            peer: None,
            pending: PendingTable::new(),
            subscriptions: Subscriptions::new(events_tx),
            host_events,
        }
    }

    /// Bind the configured address and build an agent fed by it.
    ///
    /// Must be called inside a tokio runtime; the listener's tasks run there.
    pub async fn bind(config: AgentConfig) -> io::Result<(Self, Listener)> {
        let (listener, inbox) = transport::bind(&config.host, config.port).await?;
        Ok((Self::new(config, inbox), listener))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.peer.as_ref().map(|peer| peer.connection)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run one cooperative step. Call once per frame.
    pub fn tick(&mut self, host: &mut dyn Host, now: Instant) {
        self.drain_transport(host, now);
        self.drain_host_events(host, now);
        self.resume_due(host, now);
    }

    /// Abort everything owned by the current connection and forget it.
    pub fn shutdown(&mut self, host: &mut dyn Host) {
        if let Some(peer) = self.peer.take() {
            self.teardown(host, peer.connection);
        }
    }

    fn drain_transport(&mut self, host: &mut dyn Host, now: Instant) {
        let mut dispatched = 0;
        while dispatched < self.config.max_messages_per_tick {
            let event = match self.inbox.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            };
            match event {
                TransportEvent::Connected {
                    connection,
                    outbound,
                } => self.on_connected(host, connection, outbound),
                TransportEvent::Closed { connection } => self.on_closed(host, connection),
                TransportEvent::Message { connection, text } => {
                    if self.connection() != Some(connection) {
                        tracing::debug!(%connection, "Dropping message from superseded connection");
                        continue;
                    }
                    dispatched += 1;
                    self.dispatch(host, now, connection, &text);
                }
                TransportEvent::Malformed { connection, reason } => {
                    if self.connection() != Some(connection) {
                        continue;
                    }
                    dispatched += 1;
                    tracing::warn!(%connection, %reason, "Rejected undecodable frame");
                    self.send(connection, Response::failure(None, RpcError::parse_error(reason)));
                }
            }
        }
    }

    fn on_connected(
        &mut self,
        host: &mut dyn Host,
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<Response>,
    ) {
        if let Some(previous) = self.peer.take() {
            tracing::info!(previous = %previous.connection, %connection, "Connection superseded");
            self.teardown(host, previous.connection);
        }
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            capabilities: None,
        };
        tracing::info!(%connection, session = %session.id, "Session started");
        self.peer = Some(Peer {
            connection,
            outbound,
            session,
        });
    }

    fn on_closed(&mut self, host: &mut dyn Host, connection: ConnectionId) {
        if self.connection() == Some(connection) {
            self.peer = None;
            tracing::info!(%connection, "Session ended");
        }
        self.teardown(host, connection);
    }

    /// Abort every pending operation of `connection`. No responses are sent.
    fn teardown(&mut self, host: &mut dyn Host, connection: ConnectionId) {
        let aborted = self.pending.drain_connection(connection);
        if aborted.is_empty() {
            return;
        }
        for (key, mut entry) in aborted {
            tracing::debug!(
                %connection,
                request_id = %key.request,
                method = entry.method,
                "Aborting pending operation"
            );
            entry.operation.abort(host);
        }
    }

    fn dispatch(&mut self, host: &mut dyn Host, now: Instant, connection: ConnectionId, text: &str) {
        let request = match parse_request(text) {
            Ok(request) => request,
            Err(rejected) => {
                tracing::warn!(%connection, error = %rejected.error, "Rejected malformed request");
                self.send(connection, rejected.into_response());
                return;
            }
        };

        let key = PendingKey::new(connection, request.id.clone());
        if self.pending.contains(&key) {
            tracing::warn!(%connection, request_id = %request.id, "Duplicate in-flight request id");
            self.send(
                connection,
                Response::failure(
                    None,
                    RpcError::invalid_request(format!("id {} is already in flight", request.id)),
                ),
            );
            return;
        }

        tracing::debug!(%connection, request_id = %request.id, method = %request.method, "Dispatching");

        let handler = capabilities::lookup(&request.method)
            .and_then(|spec| handlers::handler_for(spec.name).map(|handler| (spec, handler)));
        let Some((spec, handler)) = handler else {
            self.send(
                connection,
                Response::failure(Some(request.id), RpcError::method_not_found(&request.method)),
            );
            return;
        };

        if spec.requires_unsafe && !self.config.unsafe_mode {
            self.send(
                connection,
                Response::failure(Some(request.id), RpcError::unsafe_mode_required(spec.name)),
            );
            return;
        }

        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        let mut ctx = HandlerContext {
            host,
            config: &self.config,
            now,
            session: &mut peer.session,
            subscriptions: &mut self.subscriptions,
        };

        match handler(&mut ctx, request.params) {
            Ok(Dispatch::Reply(result)) => self.send(connection, Response::success(request.id, result)),
            Err(error) => {
                tracing::debug!(request_id = %request.id, method = spec.name, %error, "Request failed");
                self.send(connection, Response::failure(Some(request.id), error));
            }
            Ok(Dispatch::Pending { operation, wake_at }) => {
                tracing::debug!(
                    request_id = %request.id,
                    method = spec.name,
                    wake_in_ms = wake_at.saturating_duration_since(now).as_millis() as u64,
                    "Registered pending operation"
                );
                self.pending.insert(key, spec.name, operation, now, wake_at);
            }
        }
    }

    fn drain_host_events(&mut self, host: &mut dyn Host, now: Instant) {
        while let Ok(event) = self.host_events.try_recv() {
            let subscription = event.subscription();
            let Some(key) = self.pending.key_for_subscription(subscription).cloned() else {
                tracing::trace!(%subscription, "Ignoring host event for finished wait");
                continue;
            };
            let Some(entry) = self.pending.get_mut(&key) else {
                continue;
            };
            if let Some(Step::Complete(result)) =
                entry.operation.on_host_event(host, event, now, entry.started_at)
            {
                self.complete(&key, result);
            }
        }
    }

    fn resume_due(&mut self, host: &mut dyn Host, now: Instant) {
        for key in self.pending.due(now) {
            let Some(entry) = self.pending.get_mut(&key) else {
                continue;
            };
            match entry.operation.resume(host, now, entry.started_at) {
                Step::Yield(wake_at) => entry.wake_at = wake_at,
                Step::Complete(result) => self.complete(&key, result),
            }
        }
    }

    /// Remove the entry and send its response in one step.
    fn complete(&mut self, key: &PendingKey, result: Result<serde_json::Value, RpcError>) {
        let Some(entry) = self.pending.remove(key) else {
            return;
        };
        tracing::debug!(
            request_id = %key.request,
            method = entry.method,
            ok = result.is_ok(),
            "Completed pending operation"
        );
        self.send(key.connection, Response::from_result(key.request.clone(), result));
    }

    fn send(&self, connection: ConnectionId, response: Response) {
        let Some(peer) = self.peer.as_ref().filter(|peer| peer.connection == connection) else {
            tracing::debug!(%connection, "Dropping response for closed connection");
            return;
        };
        if peer.outbound.send(response).is_err() {
            tracing::debug!(%connection, "Connection writer gone, dropping response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, RequestId, TARGET_INVALIDATED,
        UNSAFE_MODE_REQUIRED,
    };
    use crate::host::InputEvent;
    use crate::test_support::FakeHost;
    use serde_json::{Value, json};
    use std::time::Duration;

    struct Harness {
        agent: Agent,
        host: FakeHost,
        transport: mpsc::UnboundedSender<TransportEvent>,
        responses: mpsc::UnboundedReceiver<Response>,
        connection: ConnectionId,
        start: Instant,
    }

    impl Harness {
        fn new(config: AgentConfig, host: FakeHost) -> Self {
            let (transport, inbox) = mpsc::unbounded_channel();
            let mut harness = Self {
                agent: Agent::new(config, inbox),
                host,
                transport,
                responses: mpsc::unbounded_channel().1,
                connection: ConnectionId::new(0),
                start: Instant::now(),
            };
            harness.connect(1);
            harness
        }

        fn connect(&mut self, id: u64) {
            let (outbound, responses) = mpsc::unbounded_channel();
            self.connection = ConnectionId::new(id);
            self.responses = responses;
            self.transport
                .send(TransportEvent::Connected {
                    connection: self.connection,
                    outbound,
                })
                .unwrap();
            self.tick(0);
        }

        fn send(&self, text: &str) {
            self.transport
                .send(TransportEvent::Message {
                    connection: self.connection,
                    text: text.to_string(),
                })
                .unwrap();
        }

        fn request(&self, id: i64, method: &str, params: Value) {
            self.send(&json!({"id": id, "method": method, "params": params}).to_string());
        }

        fn tick(&mut self, at_ms: u64) {
            let now = self.start + Duration::from_millis(at_ms);
            self.agent.tick(&mut self.host, now);
        }

        fn responses(&mut self) -> Vec<Response> {
            let mut out = Vec::new();
            while let Ok(response) = self.responses.try_recv() {
                out.push(response);
            }
            out
        }

        fn one(&mut self) -> Response {
            let mut responses = self.responses();
            assert_eq!(responses.len(), 1, "{responses:?}");
            responses.remove(0)
        }
    }

    fn harness() -> Harness {
        Harness::new(AgentConfig::default(), FakeHost::new())
    }

    #[test]
    fn sync_request_answers_in_same_tick() {
        let mut h = harness();
        h.host.frame = 42;
        h.request(1, "ping", json!({}));
        h.tick(1);
        let response = h.one();
        insta::assert_json_snapshot!(response, @r#"
        {
          "id": 1,
          "result": {
            "frame": 42,
            "pong": true
          }
        }
        "#);
    }

    #[test]
    fn structural_errors_use_null_id() {
        let mut h = harness();
        h.send("{nope");
        h.send(r#"{"id": 9, "method": ""}"#);
        h.tick(1);
        let responses = h.responses();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.id.is_none()));
        let codes: Vec<i64> = responses
            .into_iter()
            .map(|r| r.into_result().unwrap_err().code)
            .collect();
        assert_eq!(codes, vec![PARSE_ERROR, INVALID_REQUEST]);
    }

    #[test]
    fn undecodable_frame_is_answered_without_ending_session() {
        let mut h = harness();
        h.request(1, "wait", json!({"ms": 300}));
        h.transport
            .send(TransportEvent::Malformed {
                connection: h.connection,
                reason: "invalid utf-8 sequence of 1 bytes from index 0".into(),
            })
            .unwrap();
        h.request(2, "ping", json!({}));
        h.tick(1);

        let responses = h.responses();
        assert_eq!(responses.len(), 2, "{responses:?}");
        assert_eq!(responses[0].id, None);
        assert_eq!(responses[0].clone().into_result().unwrap_err().code, PARSE_ERROR);
        assert_eq!(responses[1].id, Some(RequestId::Number(2)));
        assert_eq!(h.agent.pending_count(), 1);

        h.tick(301);
        let done = h.one();
        assert_eq!(done.id, Some(RequestId::Number(1)));
        assert!(!done.is_error());
    }

    #[test]
    fn unknown_method_keeps_id() {
        let mut h = harness();
        h.request(3, "explode", json!({}));
        h.tick(1);
        let response = h.one();
        assert_eq!(response.id, Some(RequestId::Number(3)));
        assert_eq!(response.into_result().unwrap_err().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn elevated_methods_blocked_before_any_work() {
        let mut h = harness();
        h.host.set_expression("1", json!(1));
        h.request(1, "evaluate", json!({"expression": "1"}));
        h.request(2, "wait_for_condition", json!({"expression": "1"}));
        h.tick(1);
        for response in h.responses() {
            assert_eq!(response.into_result().unwrap_err().code, UNSAFE_MODE_REQUIRED);
        }
        assert_eq!(h.host.evaluations, 0);
    }

    #[test]
    fn timed_wait_answers_once_when_due() {
        let mut h = harness();
        h.request(1, "wait", json!({"ms": 50}));
        h.tick(1);
        assert!(h.responses().is_empty());
        assert_eq!(h.agent.pending_count(), 1);

        h.tick(40);
        assert!(h.responses().is_empty());

        h.tick(60);
        let response = h.one();
        assert_eq!(response.into_result().unwrap(), json!({"waited_ms": 59}));
        assert_eq!(h.agent.pending_count(), 0);

        h.tick(200);
        assert!(h.responses().is_empty());
    }

    #[test]
    fn duplicate_in_flight_id_is_rejected() {
        let mut h = harness();
        h.request(7, "wait", json!({"ms": 50}));
        h.request(7, "wait", json!({"ms": 10}));
        h.tick(1);
        let response = h.one();
        assert_eq!(response.id, None);
        assert_eq!(response.into_result().unwrap_err().code, INVALID_REQUEST);

        h.tick(60);
        assert_eq!(h.one().id, Some(RequestId::Number(7)));
    }

    #[test]
    fn responses_keep_their_own_ids_out_of_order() {
        let mut h = harness();
        h.request(1, "wait", json!({"ms": 30}));
        h.request(2, "wait", json!({"ms": 10}));
        h.request(3, "ping", json!({}));
        h.tick(0);
        h.tick(15);
        h.tick(35);
        let ids: Vec<Option<RequestId>> = h.responses().into_iter().map(|r| r.id).collect();
        assert_eq!(
            ids,
            vec![
                Some(RequestId::Number(3)),
                Some(RequestId::Number(2)),
                Some(RequestId::Number(1))
            ]
        );
    }

    #[test]
    fn message_budget_spreads_over_ticks() {
        let config = AgentConfig::default().with_max_messages_per_tick(2);
        let mut h = Harness::new(config, FakeHost::new());
        for id in 0..5 {
            h.request(id, "ping", json!({}));
        }
        h.tick(1);
        assert_eq!(h.responses().len(), 2);
        h.tick(2);
        h.tick(3);
        assert_eq!(h.responses().len(), 3);
    }

    #[test]
    fn condition_poll_with_tiny_timeout_evaluates_once() {
        let config = AgentConfig::default().with_unsafe_mode(true);
        let mut h = Harness::new(config, FakeHost::new());
        h.host.set_expression("done", json!(false));
        h.request(
            1,
            "wait_for_condition",
            json!({"expression": "done", "timeout_ms": 1, "poll_interval_ms": 100}),
        );
        h.tick(0);
        assert_eq!(h.host.evaluations, 1);
        assert!(h.responses().is_empty());

        h.tick(1);
        let result = h.one().into_result().unwrap();
        assert_eq!(result["satisfied"], json!(false));
        assert_eq!(result["timeout"], json!(true));
    }

    #[test]
    fn event_wait_completes_from_host_event() {
        let mut h = Harness::new(AgentConfig::default(), FakeHost::new().with_node("/root/Timer", &[]));
        h.request(1, "wait_for_event", json!({"source": "/root/Timer", "event": "timeout"}));
        h.tick(0);
        h.host.emit("/root/Timer", "timeout", vec![json!("a"), json!(2)]);
        h.host.emit("/root/Timer", "timeout", vec![json!("late")]);
        h.tick(3);

        let result = h.one().into_result().unwrap();
        assert_eq!(result, json!({"received": true, "args": ["a", 2], "elapsed_ms": 3}));
        assert!(h.host.subscriptions.is_empty());

        h.tick(10_000);
        assert!(h.responses().is_empty());
    }

    #[test]
    fn event_source_destroyed_mid_wait() {
        let mut h = Harness::new(AgentConfig::default(), FakeHost::new().with_node("/root/Door", &[]));
        h.request(1, "wait_for_event", json!({"source": "/root/Door", "event": "opened"}));
        h.tick(0);
        h.host.destroy("/root/Door");
        h.tick(1);
        assert_eq!(h.one().into_result().unwrap_err().code, TARGET_INVALIDATED);
    }

    #[test]
    fn close_aborts_pending_and_releases_input() {
        let mut h = Harness::new(AgentConfig::default(), FakeHost::new().with_node("/root/Timer", &[]));
        h.request(1, "press_key", json!({"key": "shift", "duration_ms": 1000}));
        h.request(2, "wait_for_event", json!({"source": "/root/Timer", "event": "timeout"}));
        h.tick(0);
        assert_eq!(h.agent.pending_count(), 2);

        h.transport
            .send(TransportEvent::Closed {
                connection: h.connection,
            })
            .unwrap();
        h.tick(1);

        assert_eq!(h.agent.pending_count(), 0);
        assert_eq!(h.agent.connection(), None);
        assert_eq!(
            h.host.inputs.last(),
            Some(&InputEvent::Key {
                key: "shift".into(),
                pressed: false
            })
        );
        assert!(h.host.subscriptions.is_empty());
        assert!(h.responses().is_empty());
    }

    #[test]
    fn new_connection_supersedes_and_gets_fresh_session() {
        let mut h = harness();
        h.request(1, "hello", json!({}));
        h.request(2, "wait", json!({"ms": 100}));
        h.tick(0);
        let first = h.one().into_result().unwrap();

        h.connect(2);
        assert_eq!(h.agent.pending_count(), 0);
        assert_eq!(h.agent.connection(), Some(ConnectionId::new(2)));

        h.request(1, "hello", json!({}));
        h.tick(1);
        let second = h.one().into_result().unwrap();
        assert_ne!(first["session"], second["session"]);

        // A late close for the old peer changes nothing.
        h.transport
            .send(TransportEvent::Closed {
                connection: ConnectionId::new(1),
            })
            .unwrap();
        h.tick(2);
        assert_eq!(h.agent.connection(), Some(ConnectionId::new(2)));
    }

    #[test]
    fn tween_runs_over_ticks() {
        let mut h = Harness::new(
            AgentConfig::default(),
            FakeHost::new().with_node("/root/Box", &[("alpha", json!(0.0))]),
        );
        h.request(
            1,
            "tween_property",
            json!({"path": "/root/Box", "property": "alpha", "to": 1.0, "duration_ms": 32}),
        );
        h.tick(0);
        h.tick(16);
        assert_eq!(h.host.property("/root/Box", "alpha"), json!(0.5));
        assert!(h.responses().is_empty());
        h.tick(32);
        let result = h.one().into_result().unwrap();
        assert_eq!(result["steps"], json!(2));
        assert_eq!(result["value"], json!(1.0));
    }
}

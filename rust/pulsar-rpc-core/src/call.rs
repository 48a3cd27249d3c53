//! Client call state machine.
//!
//! A [`Call`] drives one RPC through
//! `Created -> HeadersSent -> Active -> HalfClosed -> Completed`, with
//! `Cancelled` reachable from every non-terminal state. Outbound operations
//! publish envelopes to the service's request topic; inbound envelopes arrive
//! from the channel's reply loop through [`InboundSink`] and are surfaced to a
//! [`CallListener`] on a dedicated task.
//!
//! Every terminal path (peer STATUS, cancel, deadline, local failure) goes
//! through `terminate`, which runs exactly once per call: it deregisters the
//! id, releases the reply subscription reference, stops the deadline timer
//! and queues the single `on_close`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use pulsar_rpc_wire::{
    CorrelationId, Envelope, Kind, METHOD_KEY, Metadata, REPLY_TO_KEY, Status, TIMEOUT_KEY,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::ChannelShared;
use crate::reorder::{Admit, Reorder};
use crate::{CallError, MethodDescriptor};

/// Receives the inbound side of one call.
///
/// Callbacks for one call never run concurrently and never run on the stack
/// of the code driving the call. `on_close` is invoked exactly once and is
/// always the last callback.
pub trait CallListener<Resp>: Send + 'static {
    fn on_headers(&mut self, headers: Metadata) {
        let _ = headers;
    }

    fn on_message(&mut self, message: Resp);

    fn on_close(&mut self, status: Status, trailers: Metadata);
}

/// Observable lifecycle state of a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created,
    HeadersSent,
    Active,
    HalfClosed,
    Completed,
    Cancelled,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Cancelled)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    deadline: Option<Instant>,
    metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the call with `DEADLINE_EXCEEDED` once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Metadata the typed client helpers send with HEADERS.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Delivery target for envelopes routed by correlation id.
pub(crate) trait InboundSink: Send + Sync {
    fn deliver(&self, envelope: Envelope);

    /// Terminate locally with `status`, notifying the peer if started.
    fn abort(self: Arc<Self>, status: Status) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    /// Waiting for the reply route or the HEADERS acknowledgement.
    Starting,
    HeadersSent,
    Active,
    HalfClosed,
    Completed,
    Cancelled,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled)
    }
}

/// How a call ended, for phase and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Peer sent STATUS.
    Completed,
    /// Cancel or deadline.
    Cancelled,
    /// Local protocol, codec or transport failure.
    Failed,
}

enum Event<Resp> {
    Headers(Metadata),
    Message(Resp),
    Close(Status, Metadata),
}

struct CallCore<Resp> {
    phase: Phase,
    next_seq: u64,
    reorder: Reorder,
    events: Option<mpsc::UnboundedSender<Event<Resp>>>,
    listener_attached: bool,
    timer: Option<JoinHandle<()>>,
    registered: bool,
    route_acquired: bool,
    headers_seen: bool,
    messages_received: u64,
    closed: Option<Status>,
}

struct CallInner<Req, Resp> {
    id: CorrelationId,
    descriptor: MethodDescriptor<Req, Resp>,
    channel: Arc<ChannelShared>,
    request_topic: String,
    deadline: Option<Instant>,
    core: Mutex<CallCore<Resp>>,
}

/// Result of a successful `terminate`.
struct Terminated {
    /// Whether HEADERS may have reached the server.
    started: bool,
    /// Sequence number reserved for a cancellation STATUS.
    seq: u64,
}

/// One RPC invocation. Cheap to clone; clones share the call.
pub struct Call<Req, Resp> {
    inner: Arc<CallInner<Req, Resp>>,
}

impl<Req, Resp> Clone for Call<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Resp> Call<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(
        channel: Arc<ChannelShared>,
        descriptor: MethodDescriptor<Req, Resp>,
        deadline: Option<Instant>,
    ) -> Self {
        let request_topic = channel.topics.request_topic(descriptor.service());
        let window = channel.config.reorder_window;
        Self {
            inner: Arc::new(CallInner {
                id: CorrelationId::generate(),
                descriptor,
                channel,
                request_topic,
                deadline,
                core: Mutex::new(CallCore {
                    phase: Phase::Created,
                    next_seq: 0,
                    reorder: Reorder::new(window),
                    events: None,
                    listener_attached: false,
                    timer: None,
                    registered: false,
                    route_acquired: false,
                    headers_seen: false,
                    messages_received: 0,
                    closed: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.inner.id
    }

    pub fn descriptor(&self) -> &MethodDescriptor<Req, Resp> {
        &self.inner.descriptor
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn state(&self) -> CallState {
        match self.inner.core.lock().phase {
            Phase::Created | Phase::Starting => CallState::Created,
            Phase::HeadersSent => CallState::HeadersSent,
            Phase::Active => CallState::Active,
            Phase::HalfClosed => CallState::HalfClosed,
            Phase::Completed => CallState::Completed,
            Phase::Cancelled => CallState::Cancelled,
        }
    }

    /// Terminal status, once the call has one.
    pub fn status(&self) -> Option<Status> {
        self.inner.core.lock().closed.clone()
    }

    /// Attach `listener`, open the reply route and publish HEADERS.
    ///
    /// Starting a call that was cancelled before start delivers
    /// `on_close(CANCELLED)` and returns `Ok`.
    pub async fn start<L>(&self, listener: L, metadata: Metadata) -> Result<(), CallError>
    where
        L: CallListener<Resp>,
    {
        let inner = &self.inner;
        {
            let mut core = inner.core.lock();
            if core.listener_attached {
                return Err(CallError::ProtocolViolation("call already started"));
            }
            core.listener_attached = true;
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain_events(rx, listener));
            match core.phase {
                Phase::Created => {
                    core.phase = Phase::Starting;
                    core.events = Some(tx);
                }
                _ => {
                    let status = core
                        .closed
                        .clone()
                        .unwrap_or_else(|| Status::cancelled("call cancelled before start"));
                    let _ = tx.send(Event::Close(status, Metadata::new()));
                    return Ok(());
                }
            }
        }

        let service = inner.descriptor.service();
        let reply_topic = match inner.channel.routes.acquire(service).await {
            Ok(topic) => topic,
            Err(e) => {
                let err = CallError::Transport(e);
                inner.terminate(err.to_status(), Metadata::new(), Outcome::Failed, false);
                return Err(err);
            }
        };

        {
            let mut core = inner.core.lock();
            if core.phase != Phase::Starting {
                // Cancelled while the route was being opened.
                drop(core);
                inner.channel.routes.release(service);
                return Ok(());
            }
            core.route_acquired = true;
        }

        if let Err(e) = inner
            .channel
            .registry
            .register(inner.id, inner.clone() as Arc<dyn InboundSink>)
        {
            let err = CallError::from(e);
            inner.terminate(err.to_status(), Metadata::new(), Outcome::Failed, false);
            return Err(err);
        }

        let seq = {
            let mut core = inner.core.lock();
            core.registered = true;
            if core.phase != Phase::Starting {
                // Cancelled between the two locks; the route was already
                // released by the cancellation.
                core.registered = false;
                drop(core);
                inner.channel.registry.remove(&inner.id);
                return Ok(());
            }
            if let Some(deadline) = inner.deadline {
                let weak = Arc::downgrade(inner);
                core.timer = Some(tokio::spawn(deadline_timer(weak, deadline)));
            }
            let seq = core.next_seq;
            core.next_seq += 1;
            seq
        };

        let mut headers = metadata;
        headers.remove(METHOD_KEY);
        headers.remove(REPLY_TO_KEY);
        headers.remove(TIMEOUT_KEY);
        headers.insert(METHOD_KEY, inner.descriptor.full_name());
        headers.insert(REPLY_TO_KEY, reply_topic);
        if let Some(deadline) = inner.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            headers.insert(TIMEOUT_KEY, remaining.as_millis().to_string());
        }

        inner.channel.metrics.record_call_started();
        tracing::debug!(
            correlation_id = %inner.id,
            method = %inner.descriptor.full_name(),
            "starting call"
        );

        let envelope = Envelope::headers(inner.id, seq, headers);
        if let Err(e) = inner
            .channel
            .publisher
            .publish(&inner.request_topic, &envelope)
            .await
        {
            let err = CallError::Transport(e);
            inner.terminate(err.to_status(), Metadata::new(), Outcome::Failed, false);
            return Err(err);
        }

        let mut core = inner.core.lock();
        if core.phase == Phase::Starting {
            core.phase = Phase::HeadersSent;
        }
        Ok(())
    }

    /// Encode and publish one request message.
    pub async fn send_message(&self, message: &Req) -> Result<(), CallError> {
        let inner = &self.inner;
        let reserved = {
            let mut core = inner.core.lock();
            match core.phase {
                Phase::Created | Phase::Starting => {
                    return Err(CallError::ProtocolViolation("send before start"));
                }
                Phase::Completed | Phase::Cancelled => {
                    return Err(CallError::Closed(closed_status(&core)));
                }
                Phase::HalfClosed => Err(CallError::ProtocolViolation("send after half-close")),
                Phase::Active if !inner.descriptor.kind().client_streaming() => Err(
                    CallError::ProtocolViolation("second message on non-client-streaming method"),
                ),
                Phase::HeadersSent | Phase::Active => {
                    core.phase = Phase::Active;
                    let seq = core.next_seq;
                    core.next_seq += 1;
                    Ok(seq)
                }
            }
        };
        let seq = match reserved {
            Ok(seq) => seq,
            Err(err) => return Err(inner.fail(err)),
        };

        let payload = match inner.descriptor.request_marshaller().encode(message) {
            Ok(payload) => payload,
            Err(e) => return Err(inner.fail(CallError::Encode(e))),
        };

        let envelope = Envelope::message(inner.id, seq, payload);
        inner
            .channel
            .publisher
            .publish(&inner.request_topic, &envelope)
            .await
            .map(|_| ())
            .map_err(|e| inner.fail(CallError::Transport(e)))
    }

    /// Signal that no more request messages follow.
    pub async fn half_close(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let seq = {
            let mut core = inner.core.lock();
            match core.phase {
                Phase::Created | Phase::Starting => {
                    return Err(CallError::ProtocolViolation("half-close before start"));
                }
                Phase::HalfClosed => {
                    return Err(CallError::ProtocolViolation("half-close called twice"));
                }
                Phase::Completed | Phase::Cancelled => {
                    return Err(CallError::Closed(closed_status(&core)));
                }
                Phase::HeadersSent | Phase::Active => {
                    // Without a message the server cannot tell the request
                    // is complete, so HALF_CLOSE goes out in that case too.
                    let publish = inner.descriptor.kind().client_streaming()
                        || core.phase == Phase::HeadersSent;
                    core.phase = Phase::HalfClosed;
                    if publish {
                        let seq = core.next_seq;
                        core.next_seq += 1;
                        Some(seq)
                    } else {
                        None
                    }
                }
            }
        };

        let Some(seq) = seq else {
            return Ok(());
        };
        let envelope = Envelope::half_close(inner.id, seq);
        inner
            .channel
            .publisher
            .publish(&inner.request_topic, &envelope)
            .await
            .map(|_| ())
            .map_err(|e| inner.fail(CallError::Transport(e)))
    }

    /// Cancel the call. No-op once the call is terminal.
    pub async fn cancel(&self, reason: impl Into<String>) {
        self.inner
            .clone()
            .abort_with(Status::cancelled(reason), Outcome::Cancelled, false)
            .await
    }
}

fn closed_status<Resp>(core: &CallCore<Resp>) -> Status {
    core.closed
        .clone()
        .unwrap_or_else(|| Status::cancelled("call closed"))
}

impl<Req, Resp> CallInner<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Run the terminal transition. Returns `None` if the call was already
    /// terminal.
    fn terminate(
        &self,
        status: Status,
        trailers: Metadata,
        outcome: Outcome,
        from_timer: bool,
    ) -> Option<Terminated> {
        let (terminated, timer, registered, route, events) = {
            let mut core = self.core.lock();
            if core.phase.is_terminal() {
                return None;
            }
            let started = core.registered;
            let seq = core.next_seq;
            core.next_seq += 1;
            core.phase = match outcome {
                Outcome::Cancelled => Phase::Cancelled,
                Outcome::Completed | Outcome::Failed => Phase::Completed,
            };
            core.closed = Some(status.clone());
            (
                Terminated { started, seq },
                core.timer.take(),
                std::mem::take(&mut core.registered),
                std::mem::take(&mut core.route_acquired),
                core.events.take(),
            )
        };

        if let Some(timer) = timer.filter(|_| !from_timer) {
            timer.abort();
        }
        if registered {
            self.channel.registry.remove(&self.id);
        }
        if route {
            self.channel.routes.release(self.descriptor.service());
        }

        let metrics = &self.channel.metrics;
        match outcome {
            Outcome::Completed => metrics.record_call_completed(),
            Outcome::Cancelled => metrics.record_call_cancelled(),
            Outcome::Failed => metrics.record_call_failed(),
        }
        tracing::debug!(
            correlation_id = %self.id,
            code = %status.code(),
            message = status.message(),
            "call closed"
        );

        if let Some(events) = events {
            let _ = events.send(Event::Close(status, trailers));
        }
        Some(terminated)
    }

    /// Terminate on a local error and hand the error back.
    fn fail(&self, err: CallError) -> CallError {
        if let CallError::ProtocolViolation(msg) = &err {
            tracing::warn!(correlation_id = %self.id, violation = *msg, "protocol violation");
        }
        self.terminate(err.to_status(), Metadata::new(), Outcome::Failed, false);
        err
    }

    /// Terminate locally and tell the server, if it may know the call.
    async fn abort_with(self: Arc<Self>, status: Status, outcome: Outcome, from_timer: bool) {
        let Some(terminated) = self.terminate(status.clone(), Metadata::new(), outcome, from_timer)
        else {
            return;
        };
        if !terminated.started {
            return;
        }
        let envelope = Envelope::status(self.id, terminated.seq, status, Metadata::new());
        if let Err(e) = self
            .channel
            .publisher
            .publish(&self.request_topic, &envelope)
            .await
        {
            tracing::debug!(correlation_id = %self.id, error = %e, "failed to notify server of cancellation");
        }
    }

    /// Apply one in-order envelope. Returns the terminal transition it
    /// causes, if any.
    fn apply(
        &self,
        core: &mut CallCore<Resp>,
        envelope: Envelope,
    ) -> Option<(Status, Metadata, Outcome)> {
        match envelope.kind {
            Kind::Headers => {
                if core.headers_seen {
                    tracing::warn!(correlation_id = %self.id, "ignoring duplicate response headers");
                } else {
                    core.headers_seen = true;
                    send_event(core, Event::Headers(envelope.metadata));
                }
                None
            }
            Kind::Message => {
                if core.messages_received > 0 && !self.descriptor.kind().server_streaming() {
                    return Some((
                        Status::internal("more than one response on non-server-streaming method"),
                        Metadata::new(),
                        Outcome::Failed,
                    ));
                }
                let payload = envelope.payload.unwrap_or_default();
                match self.descriptor.response_marshaller().decode(&payload) {
                    Ok(message) => {
                        core.messages_received += 1;
                        send_event(core, Event::Message(message));
                        None
                    }
                    Err(e) => Some((
                        CallError::Decode(e).to_status(),
                        Metadata::new(),
                        Outcome::Failed,
                    )),
                }
            }
            Kind::HalfClose => {
                tracing::trace!(correlation_id = %self.id, "ignoring half-close from server");
                None
            }
            Kind::Status => {
                let status = envelope
                    .status
                    .unwrap_or_else(|| Status::internal("status envelope without status"));
                Some((status, envelope.metadata, Outcome::Completed))
            }
        }
    }
}

fn send_event<Resp>(core: &CallCore<Resp>, event: Event<Resp>) {
    if let Some(events) = &core.events {
        let _ = events.send(event);
    }
}

impl<Req, Resp> InboundSink for CallInner<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn deliver(&self, envelope: Envelope) {
        let seq = envelope.seq;
        let close = {
            let mut core = self.core.lock();
            if core.phase.is_terminal() {
                self.channel.metrics.record_unroutable();
                tracing::trace!(correlation_id = %self.id, seq, "dropping envelope for closed call");
                return;
            }
            match core.reorder.admit(envelope) {
                Admit::Duplicate => {
                    self.channel.metrics.record_duplicate();
                    tracing::trace!(correlation_id = %self.id, seq, "dropping duplicate envelope");
                    None
                }
                Admit::Buffered => None,
                Admit::Overflow => Some((
                    Status::internal("reply reorder window exceeded"),
                    Metadata::new(),
                    Outcome::Failed,
                )),
                Admit::Ready(envelopes) => {
                    let mut close = None;
                    for envelope in envelopes {
                        close = self.apply(&mut core, envelope);
                        if close.is_some() {
                            break;
                        }
                    }
                    close
                }
            }
        };

        if let Some((status, trailers, outcome)) = close {
            self.terminate(status, trailers, outcome, false);
        }
    }

    fn abort(self: Arc<Self>, status: Status) -> BoxFuture<'static, ()> {
        Box::pin(self.abort_with(status, Outcome::Failed, false))
    }
}

async fn deadline_timer<Req, Resp>(call: Weak<CallInner<Req, Resp>>, deadline: Instant)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    tokio::time::sleep_until(deadline).await;
    if let Some(call) = call.upgrade() {
        call.abort_with(
            Status::deadline_exceeded("deadline exceeded"),
            Outcome::Cancelled,
            true,
        )
        .await;
    }
}

async fn drain_events<Resp, L>(mut events: mpsc::UnboundedReceiver<Event<Resp>>, mut listener: L)
where
    L: CallListener<Resp>,
{
    while let Some(event) = events.recv().await {
        match event {
            Event::Headers(headers) => listener.on_headers(headers),
            Event::Message(message) => listener.on_message(message),
            Event::Close(status, trailers) => {
                listener.on_close(status, trailers);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pulsar_rpc_wire::Code;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::test_support::{
        CLIENT_ID, RecordingListener, RecordingProducer, ScriptedConsumer, ScriptedSubscription,
        Seen, init_tracing, json_payload, say, test_channel,
    };
    use crate::{Channel, ChannelConfig, MethodKind, TopicConsumer, TransportError};

    const REQUESTS: &str = "Echo.requests";
    const REPLIES: &str = "Echo.replies.c1";

    fn close_code<T>(seen: Option<Seen<T>>) -> Code {
        match seen {
            Some(Seen::Close(status)) => status.code(),
            _ => panic!("expected on_close"),
        }
    }

    #[tokio::test]
    async fn unary_call_surfaces_reordered_replies() {
        init_tracing();
        let (channel, producer, consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();

        call.start(listener, Metadata::new().with("X-Trace", "abc"))
            .await
            .unwrap();
        assert_eq!(call.state(), CallState::HeadersSent);
        assert!(channel.is_registered(&call.id()));
        call.send_message(&"ping".to_string()).await.unwrap();
        call.half_close().await.unwrap();
        assert_eq!(call.state(), CallState::HalfClosed);

        let published = producer.published();
        assert_eq!(published.len(), 2);
        let (topic, headers) = &published[0];
        assert_eq!(topic, REQUESTS);
        assert_eq!(headers.kind, Kind::Headers);
        assert_eq!(headers.seq, 0);
        assert_eq!(headers.metadata.get_str(METHOD_KEY), Some("Echo/Say"));
        assert_eq!(headers.metadata.get_str(REPLY_TO_KEY), Some(REPLIES));
        assert_eq!(headers.metadata.get_str("x-trace"), Some("abc"));
        assert!(!headers.metadata.contains_key(TIMEOUT_KEY));
        assert_eq!(published[1].1.kind, Kind::Message);
        assert_eq!(published[1].1.seq, 1);

        let id = call.id();
        consumer.push(REPLIES, &Envelope::status(id, 2, Status::ok(), Metadata::new()));
        consumer.push(REPLIES, &Envelope::message(id, 1, json_payload("pong")));
        consumer.push(REPLIES, &Envelope::headers(id, 0, Metadata::new()));

        assert!(matches!(seen.recv().await, Some(Seen::Headers(_))));
        assert_eq!(seen.recv().await, Some(Seen::Message("pong".to_string())));
        assert_eq!(seen.recv().await, Some(Seen::Close(Status::ok())));
        assert_eq!(seen.recv().await, None);

        assert_eq!(call.state(), CallState::Completed);
        assert!(!channel.is_registered(&id));
        assert_eq!(channel.reply_subscriptions(), 0);
        assert_eq!(channel.metrics().calls_completed, 1);
    }

    #[tokio::test]
    async fn cancel_before_start_registers_nothing() {
        let (channel, producer, consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());

        call.cancel("not needed").await;
        assert_eq!(call.state(), CallState::Cancelled);
        assert_eq!(channel.in_flight(), 0);

        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();
        assert_eq!(close_code(seen.recv().await), Code::Cancelled);
        assert_eq!(seen.recv().await, None);

        assert!(producer.published().is_empty());
        assert_eq!(consumer.subscribe_count(), 0);
        assert!(!channel.is_registered(&call.id()));
    }

    #[tokio::test]
    async fn cancel_twice_closes_once() {
        let (channel, producer, _consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();

        call.cancel("first").await;
        call.cancel("second").await;

        match seen.recv().await {
            Some(Seen::Close(status)) => {
                assert_eq!(status.code(), Code::Cancelled);
                assert_eq!(status.message(), "first");
            }
            _ => panic!("expected on_close"),
        }
        assert_eq!(seen.recv().await, None);

        let published = producer.published();
        assert_eq!(published.len(), 2);
        let (topic, cancel) = &published[1];
        assert_eq!(topic, REQUESTS);
        assert_eq!(cancel.kind, Kind::Status);
        assert_eq!(cancel.seq, 1);
        assert_eq!(cancel.status.as_ref().map(Status::code), Some(Code::Cancelled));
        assert!(!channel.is_registered(&call.id()));
        assert_eq!(channel.reply_subscriptions(), 0);
    }

    #[tokio::test]
    async fn second_unary_message_is_a_local_violation() {
        let (channel, producer, _consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();

        call.send_message(&"one".to_string()).await.unwrap();
        let err = call.send_message(&"two".to_string()).await.unwrap_err();
        assert!(matches!(err, CallError::ProtocolViolation(_)));
        assert_eq!(close_code(seen.recv().await), Code::Internal);

        // The peer is not told about local failures.
        assert_eq!(producer.published().len(), 2);
        assert!(matches!(
            call.send_message(&"three".to_string()).await,
            Err(CallError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn client_streaming_sends_are_sequenced() {
        let (channel, producer, _consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::ClientStreaming), CallOptions::new());
        let (listener, _seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();
        for word in ["a", "b", "c"] {
            call.send_message(&word.to_string()).await.unwrap();
        }
        call.half_close().await.unwrap();
        let err = call.send_message(&"late".to_string()).await.unwrap_err();
        assert!(matches!(err, CallError::ProtocolViolation(_)));

        let kinds: Vec<_> = producer
            .published()
            .into_iter()
            .map(|(_, env)| (env.kind, env.seq))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (Kind::Headers, 0),
                (Kind::Message, 1),
                (Kind::Message, 2),
                (Kind::Message, 3),
                (Kind::HalfClose, 4),
            ]
        );
    }

    #[tokio::test]
    async fn send_before_start_does_not_terminate() {
        let (channel, _producer, _consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let err = call.send_message(&"early".to_string()).await.unwrap_err();
        assert!(matches!(err, CallError::ProtocolViolation(_)));
        assert_eq!(call.state(), CallState::Created);
        assert!(call.status().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_cancels_with_deadline_exceeded() {
        let (channel, producer, _consumer) = test_channel();
        let call = channel.new_call(
            &say(MethodKind::Unary),
            CallOptions::new().with_timeout(Duration::from_millis(50)),
        );
        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();

        let timeout_ms: u64 = producer.published()[0]
            .1
            .metadata
            .get_str(TIMEOUT_KEY)
            .unwrap()
            .parse()
            .unwrap();
        assert!(timeout_ms <= 50);

        assert_eq!(close_code(seen.recv().await), Code::DeadlineExceeded);
        assert_eq!(call.state(), CallState::Cancelled);
        assert!(!channel.is_registered(&call.id()));

        let published = producer.published();
        let (_, last) = published.last().unwrap();
        assert_eq!(
            last.status.as_ref().map(Status::code),
            Some(Code::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn publish_failure_on_start_is_unavailable() {
        let (channel, producer, _consumer) = test_channel();
        producer.set_failing(true);
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();

        let err = call.start(listener, Metadata::new()).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
        assert_eq!(close_code(seen.recv().await), Code::Unavailable);
        assert!(!channel.is_registered(&call.id()));
        assert_eq!(channel.reply_subscriptions(), 0);
    }

    #[tokio::test]
    async fn undecodable_response_fails_locally() {
        let (channel, producer, consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();

        let id = call.id();
        consumer.push(REPLIES, &Envelope::headers(id, 0, Metadata::new()));
        consumer.push(
            REPLIES,
            &Envelope::message(id, 1, Bytes::from_static(b"{not json")),
        );
        assert!(matches!(seen.recv().await, Some(Seen::Headers(_))));
        assert_eq!(close_code(seen.recv().await), Code::Internal);
        assert_eq!(producer.published().len(), 1);
    }

    #[tokio::test]
    async fn status_then_cancel_closes_once() {
        let (channel, producer, consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();

        let status = Status::new(Code::NotFound, "no such greeting");
        consumer.push(
            REPLIES,
            &Envelope::status(call.id(), 0, status.clone(), Metadata::new()),
        );
        assert_eq!(seen.recv().await, Some(Seen::Close(status)));

        call.cancel("too late").await;
        assert_eq!(seen.recv().await, None);
        assert_eq!(call.state(), CallState::Completed);
        assert_eq!(producer.published().len(), 1);
    }

    /// Blocks `subscribe` until the gate opens.
    #[derive(Clone)]
    struct GatedConsumer {
        inner: ScriptedConsumer,
        gate: Arc<Semaphore>,
    }

    impl TopicConsumer for GatedConsumer {
        type Subscription = ScriptedSubscription;

        async fn subscribe(
            &self,
            topic: &str,
            subscription: &str,
        ) -> Result<ScriptedSubscription, TransportError> {
            let _permit = self.gate.acquire().await;
            self.inner.subscribe(topic, subscription).await
        }
    }

    #[tokio::test]
    async fn second_response_headers_are_ignored() {
        init_tracing();
        let (channel, _producer, consumer) = test_channel();
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();

        let id = call.id();
        consumer.push(REPLIES, &Envelope::headers(id, 0, Metadata::new().with("x-n", "1")));
        consumer.push(REPLIES, &Envelope::headers(id, 1, Metadata::new().with("x-n", "2")));
        consumer.push(REPLIES, &Envelope::message(id, 2, json_payload("pong")));
        consumer.push(REPLIES, &Envelope::status(id, 3, Status::ok(), Metadata::new()));

        match seen.recv().await {
            Some(Seen::Headers(headers)) => assert_eq!(headers.get_str("x-n"), Some("1")),
            other => panic!("expected headers, got {:?}", other),
        }
        assert_eq!(seen.recv().await, Some(Seen::Message("pong".to_string())));
        assert_eq!(seen.recv().await, Some(Seen::Close(Status::ok())));
        assert_eq!(seen.recv().await, None);
    }

    #[tokio::test]
    async fn reply_gap_beyond_window_fails_with_internal() {
        init_tracing();
        let producer = RecordingProducer::default();
        let consumer = ScriptedConsumer::default();
        let channel = Channel::new(
            producer.clone(),
            consumer.clone(),
            ChannelConfig::default()
                .with_client_id(CLIENT_ID)
                .with_reorder_window(2),
        );
        let call = channel.new_call(&say(MethodKind::ServerStreaming), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();
        call.start(listener, Metadata::new()).await.unwrap();

        consumer.push(REPLIES, &Envelope::message(call.id(), 10, json_payload("far")));

        assert_eq!(close_code(seen.recv().await), Code::Internal);
        assert_eq!(seen.recv().await, None);
        assert_eq!(call.state(), CallState::Completed);
        assert!(!channel.is_registered(&call.id()));
        assert_eq!(channel.metrics().calls_failed, 1);
        // Local failure: only HEADERS went out.
        assert_eq!(producer.published().len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_start_leaves_nothing_registered() {
        init_tracing();
        let producer = RecordingProducer::default();
        let gate = Arc::new(Semaphore::new(0));
        let consumer = GatedConsumer {
            inner: ScriptedConsumer::default(),
            gate: gate.clone(),
        };
        let channel = Channel::new(
            producer.clone(),
            consumer.clone(),
            ChannelConfig::default().with_client_id(CLIENT_ID),
        );
        let call = channel.new_call(&say(MethodKind::Unary), CallOptions::new());
        let (listener, mut seen) = RecordingListener::new();

        let starting = tokio::spawn({
            let call = call.clone();
            async move { call.start(listener, Metadata::new()).await }
        });
        // Let `start` run until it waits on the reply subscription.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(call.state(), CallState::Created);

        call.cancel("changed my mind").await;
        assert_eq!(close_code(seen.recv().await), Code::Cancelled);

        gate.add_permits(1);
        starting.await.unwrap().unwrap();

        assert_eq!(seen.recv().await, None);
        assert_eq!(call.state(), CallState::Cancelled);
        assert!(!channel.is_registered(&call.id()));
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.reply_subscriptions(), 0);
        assert_eq!(consumer.inner.subscribe_count(), 1);
        assert!(producer.published().is_empty());
    }
}

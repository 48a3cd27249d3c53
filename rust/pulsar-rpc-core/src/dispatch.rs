//! Server side: consumes request topics and runs handlers.
//!
//! One delivery loop per request topic multiplexes every call by
//! correlation id. A call is created on the first envelope seen for an id;
//! until its HEADERS arrives it is embryonic and only buffers. Whoever
//! removes a call from the registry first (handler completion, deadline,
//! client cancellation, local failure) owns its termination, so a call ends
//! exactly once and its id is tombstoned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use pulsar_rpc_codec::Marshaller;
use pulsar_rpc_wire::{
    CorrelationId, Envelope, Kind, METHOD_KEY, Metadata, REPLY_TO_KEY, Status, TIMEOUT_KEY,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::descriptor::split_full_name;
use crate::reorder::{Admit, Reorder};
use crate::transport::Publisher;
use crate::{
    CorrelationRegistry, DispatchError, DispatcherConfig, MAX_METHOD_NAME_LEN,
    MAX_SERVICE_NAME_LEN, MethodDescriptor, MethodKind, RpcMetrics, RpcMetricsSnapshot,
    Subscription, TopicConsumer, TopicNames, TopicProducer, TransportError,
};

/// Pause before receiving again after a transient subscription error.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lower bound on the orphan sweep period.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// Per-call information handed to a handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: CorrelationId,
    method: String,
    metadata: Metadata,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Full method name, `Service/Method`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request headers, including the reserved `rpc-*` entries.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Deadline derived from the caller's `rpc-timeout-ms`.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Request messages of one call, in the order the client sent them.
pub struct RequestStream<Req> {
    rx: mpsc::UnboundedReceiver<Bytes>,
    marshaller: Arc<dyn Marshaller<Req>>,
}

impl<Req: 'static> RequestStream<Req> {
    /// Next request. `Ok(None)` once the client half-closed.
    pub async fn message(&mut self) -> Result<Option<Req>, Status> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(payload) => self
                .marshaller
                .decode(&payload)
                .map(Some)
                .map_err(|e| Status::internal(e.to_string())),
        }
    }

    /// The only request of a unary or server-streaming call.
    pub async fn single(&mut self) -> Result<Req, Status> {
        self.message()
            .await?
            .ok_or_else(|| Status::invalid_argument("request message missing"))
    }
}

/// Publishes response messages of one call.
pub struct ResponseSink<Resp> {
    outlet: ResponseOutlet,
    marshaller: Arc<dyn Marshaller<Resp>>,
}

impl<Resp: 'static> ResponseSink<Resp> {
    /// Send response headers explicitly. Otherwise empty headers go out with
    /// the first message.
    pub async fn send_headers(&self, headers: Metadata) -> Result<(), Status> {
        self.outlet.send_headers(headers).await
    }

    pub async fn send(&self, message: &Resp) -> Result<(), Status> {
        let payload = self
            .marshaller
            .encode(message)
            .map_err(|e| Status::internal(e.to_string()))?;
        self.outlet.send_message(payload).await
    }
}

type HandlerFn<Req, Resp> = dyn Fn(RequestContext, RequestStream<Req>, ResponseSink<Resp>) -> BoxFuture<'static, Result<(), Status>>
    + Send
    + Sync;

/// Typed request handler for one method.
pub struct Handler<Req, Resp> {
    f: Arc<HandlerFn<Req, Resp>>,
}

impl<Req, Resp> Clone for Handler<Req, Resp> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<Req, Resp> Handler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + Sync + 'static,
{
    fn from_fn<F>(f: F) -> Self
    where
        F: Fn(
                RequestContext,
                RequestStream<Req>,
                ResponseSink<Resp>,
            ) -> BoxFuture<'static, Result<(), Status>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub fn unary<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::from_fn(move |ctx, mut requests, responses| {
            let f = f.clone();
            Box::pin(async move {
                let request = requests.single().await?;
                let response = f(ctx, request).await?;
                responses.send(&response).await
            })
        })
    }

    pub fn server_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext, Req, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::from_fn(move |ctx, mut requests, responses| {
            let f = f.clone();
            Box::pin(async move {
                let request = requests.single().await?;
                f(ctx, request, responses).await
            })
        })
    }

    pub fn client_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::from_fn(move |ctx, requests, responses| {
            let f = f.clone();
            Box::pin(async move {
                let response = f(ctx, requests).await?;
                responses.send(&response).await
            })
        })
    }

    pub fn bidi_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext, RequestStream<Req>, ResponseSink<Resp>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::from_fn(move |ctx, requests, responses| {
            let f = f.clone();
            Box::pin(f(ctx, requests, responses))
        })
    }
}

/// A handler bound to its descriptor, with the message types erased.
trait ErasedMethod: Send + Sync {
    fn kind(&self) -> MethodKind;

    fn invoke(
        &self,
        ctx: RequestContext,
        requests: mpsc::UnboundedReceiver<Bytes>,
        outlet: ResponseOutlet,
    ) -> BoxFuture<'static, Result<(), Status>>;
}

struct BoundMethod<Req, Resp> {
    descriptor: MethodDescriptor<Req, Resp>,
    handler: Handler<Req, Resp>,
}

impl<Req, Resp> ErasedMethod for BoundMethod<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + Sync + 'static,
{
    fn kind(&self) -> MethodKind {
        self.descriptor.kind()
    }

    fn invoke(
        &self,
        ctx: RequestContext,
        requests: mpsc::UnboundedReceiver<Bytes>,
        outlet: ResponseOutlet,
    ) -> BoxFuture<'static, Result<(), Status>> {
        let requests = RequestStream {
            rx: requests,
            marshaller: self.descriptor.request_marshaller().clone(),
        };
        let responses = ResponseSink {
            outlet,
            marshaller: self.descriptor.response_marshaller().clone(),
        };
        (self.handler.f)(ctx, requests, responses)
    }
}

fn validate_name(
    name: &str,
    max_len: usize,
    empty: DispatchError,
    too_long: DispatchError,
) -> Result<(), DispatchError> {
    if name.is_empty() {
        return Err(empty);
    }
    if name.len() > max_len {
        return Err(too_long);
    }
    if name.contains('/') {
        return Err(DispatchError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Handlers keyed by service, then method.
#[derive(Default)]
pub struct ServiceTable {
    services: HashMap<String, HashMap<String, Arc<dyn ErasedMethod>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the method `descriptor` names.
    pub fn add<Req, Resp>(
        &mut self,
        descriptor: &MethodDescriptor<Req, Resp>,
        handler: Handler<Req, Resp>,
    ) -> Result<&mut Self, DispatchError>
    where
        Req: Send + 'static,
        Resp: Send + Sync + 'static,
    {
        validate_name(
            descriptor.service(),
            MAX_SERVICE_NAME_LEN,
            DispatchError::EmptyServiceName,
            DispatchError::ServiceNameTooLong,
        )?;
        validate_name(
            descriptor.method(),
            MAX_METHOD_NAME_LEN,
            DispatchError::EmptyMethodName,
            DispatchError::MethodNameTooLong,
        )?;

        let methods = self
            .services
            .entry(descriptor.service().to_string())
            .or_default();
        if methods.contains_key(descriptor.method()) {
            return Err(DispatchError::DuplicateMethod(descriptor.full_name()));
        }
        methods.insert(
            descriptor.method().to_string(),
            Arc::new(BoundMethod {
                descriptor: descriptor.clone(),
                handler,
            }),
        );
        Ok(self)
    }

    /// Builder-style [`ServiceTable::add`].
    pub fn with<Req, Resp>(
        mut self,
        descriptor: &MethodDescriptor<Req, Resp>,
        handler: Handler<Req, Resp>,
    ) -> Result<Self, DispatchError>
    where
        Req: Send + 'static,
        Resp: Send + Sync + 'static,
    {
        self.add(descriptor, handler)?;
        Ok(self)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn contains(&self, service: &str, method: &str) -> bool {
        self.services
            .get(service)
            .is_some_and(|methods| methods.contains_key(method))
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn lookup(&self, full_name: &str) -> Option<Arc<dyn ErasedMethod>> {
        let (service, method) = split_full_name(full_name)?;
        self.services.get(service)?.get(method).cloned()
    }
}

/// Completed ids, bounded, oldest evicted first.
struct Tombstones {
    order: VecDeque<CorrelationId>,
    set: HashSet<CorrelationId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: CorrelationId) {
        if self.capacity == 0 || !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &CorrelationId) -> bool {
        self.set.contains(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    /// Envelopes seen, HEADERS not yet.
    Embryonic,
    Running,
    Done,
}

/// Which path is closing a call; that path's own task is not aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closer {
    Handler,
    Timer,
    Other,
}

struct ServerCallState {
    phase: ServerPhase,
    reorder: Reorder,
    kind: MethodKind,
    reply_to: Option<String>,
    requests: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    next_seq: u64,
    headers_sent: bool,
    messages_sent: u64,
}

struct ServerCall {
    id: CorrelationId,
    first_seen: Instant,
    state: Mutex<ServerCallState>,
}

impl ServerCall {
    fn new(id: CorrelationId, window: usize) -> Self {
        Self {
            id,
            first_seen: Instant::now(),
            state: Mutex::new(ServerCallState {
                phase: ServerPhase::Embryonic,
                reorder: Reorder::new(window),
                kind: MethodKind::Unary,
                reply_to: None,
                requests: None,
                task: None,
                timer: None,
                next_seq: 0,
                headers_sent: false,
                messages_sent: 0,
            }),
        }
    }

    /// Stop the handler and timer. Returns where and at which sequence
    /// number the final STATUS goes, if the client is reachable.
    fn close(&self, closer: Closer) -> Option<(String, u64)> {
        let (task, timer, reply) = {
            let mut state = self.state.lock();
            state.phase = ServerPhase::Done;
            state.requests = None;
            let reply = state.reply_to.clone().map(|topic| {
                // Trailers-only when no headers went out: STATUS takes seq 0.
                let seq = state.next_seq;
                state.next_seq += 1;
                state.headers_sent = true;
                (topic, seq)
            });
            (state.task.take(), state.timer.take(), reply)
        };
        if let Some(task) = task.filter(|_| closer != Closer::Handler) {
            task.abort();
        }
        if let Some(timer) = timer.filter(|_| closer != Closer::Timer) {
            timer.abort();
        }
        reply
    }
}

/// Response side of one server call, shared by its sink.
#[derive(Clone)]
struct ResponseOutlet {
    shared: Arc<DispatcherShared>,
    call: Arc<ServerCall>,
}

impl ResponseOutlet {
    async fn send_headers(&self, headers: Metadata) -> Result<(), Status> {
        let (reply_to, seq) = {
            let mut state = self.call.state.lock();
            let reply_to = open_reply(&state)?;
            if state.headers_sent {
                return Err(Status::internal("response headers already sent"));
            }
            state.headers_sent = true;
            let seq = state.next_seq;
            state.next_seq += 1;
            (reply_to, seq)
        };
        self.publish(reply_to, vec![Envelope::headers(self.call.id, seq, headers)])
            .await
    }

    async fn send_message(&self, payload: Bytes) -> Result<(), Status> {
        let (reply_to, headers_seq, seq) = {
            let mut state = self.call.state.lock();
            let reply_to = open_reply(&state)?;
            if state.messages_sent > 0 && !state.kind.server_streaming() {
                return Err(Status::internal(
                    "more than one response on non-server-streaming method",
                ));
            }
            let headers_seq = if state.headers_sent {
                None
            } else {
                state.headers_sent = true;
                let seq = state.next_seq;
                state.next_seq += 1;
                Some(seq)
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state.messages_sent += 1;
            (reply_to, headers_seq, seq)
        };
        let mut envelopes = Vec::with_capacity(2);
        if let Some(headers_seq) = headers_seq {
            envelopes.push(Envelope::headers(self.call.id, headers_seq, Metadata::new()));
        }
        envelopes.push(Envelope::message(self.call.id, seq, payload));
        self.publish(reply_to, envelopes).await
    }

    /// Publish envelopes whose sequence numbers are already reserved.
    ///
    /// Runs on its own task: aborting the handler must not leave a reserved
    /// number unpublished, or the final STATUS would wait behind the gap.
    async fn publish(&self, topic: String, envelopes: Vec<Envelope>) -> Result<(), Status> {
        let shared = self.shared.clone();
        let publishing = tokio::spawn(async move {
            for envelope in &envelopes {
                shared.publisher.publish(&topic, envelope).await?;
            }
            Ok::<_, TransportError>(())
        });
        match publishing.await {
            Ok(result) => result.map_err(|e| Status::unavailable(e.to_string())),
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }
}

fn open_reply(state: &ServerCallState) -> Result<String, Status> {
    if state.phase == ServerPhase::Done {
        return Err(Status::cancelled("call already finished"));
    }
    state
        .reply_to
        .clone()
        .ok_or_else(|| Status::internal("call has no reply topic"))
}

struct DispatcherShared {
    table: ServiceTable,
    config: DispatcherConfig,
    topics: TopicNames,
    publisher: Publisher,
    calls: CorrelationRegistry<Arc<ServerCall>>,
    tombstones: Mutex<Tombstones>,
    metrics: Arc<RpcMetrics>,
    shutdown: watch::Sender<bool>,
}

impl DispatcherShared {
    /// Take ownership of a call's termination. Only the first caller wins.
    ///
    /// The id is tombstoned under the same lock that guards creating calls,
    /// so a late envelope never finds the id both unregistered and alive.
    fn claim(&self, id: &CorrelationId) -> bool {
        let mut tombstones = self.tombstones.lock();
        let won = self.calls.remove(id).is_some();
        if won {
            tombstones.insert(*id);
        }
        won
    }

    /// The live call for `id`, created embryonic if this is its first
    /// envelope. `None` once the id is finished.
    fn call_for(&self, id: CorrelationId) -> Option<Arc<ServerCall>> {
        if let Some(call) = self.calls.lookup(&id) {
            return Some(call);
        }
        let tombstones = self.tombstones.lock();
        if tombstones.contains(&id) {
            return None;
        }
        if let Some(call) = self.calls.lookup(&id) {
            return Some(call);
        }
        let call = Arc::new(ServerCall::new(id, self.config.reorder_window));
        match self.calls.register(id, call.clone()) {
            Ok(()) => Some(call),
            Err(e) => {
                tracing::warn!(error = %e, "failed to register server call");
                None
            }
        }
    }

    /// Route one inbound envelope.
    fn handle(self: &Arc<Self>, envelope: Envelope) {
        let id = envelope.correlation_id;
        if self.tombstones.lock().contains(&id) {
            self.metrics.record_unroutable();
            tracing::trace!(correlation_id = %id, kind = %envelope.kind, "dropping envelope for finished call");
            return;
        }

        if envelope.kind == Kind::Status {
            // Client cancellation is not sequenced behind request messages.
            let status = envelope
                .status
                .unwrap_or_else(|| Status::cancelled("cancelled by client"));
            let removed = {
                let mut tombstones = self.tombstones.lock();
                // HEADERS may still be in flight; make sure it is dropped.
                tombstones.insert(id);
                self.calls.remove(&id)
            };
            match removed {
                Some(call) => {
                    call.close(Closer::Other);
                    self.metrics.record_call_cancelled();
                    tracing::debug!(
                        correlation_id = %id,
                        code = %status.code(),
                        "client cancelled call"
                    );
                }
                None => {
                    tracing::trace!(correlation_id = %id, "cancellation for unknown call");
                }
            }
            return;
        }

        let Some(call) = self.call_for(id) else {
            self.metrics.record_unroutable();
            tracing::trace!(correlation_id = %id, kind = %envelope.kind, "dropping envelope for finished call");
            return;
        };

        let seq = envelope.seq;
        let admitted = call.state.lock().reorder.admit(envelope);
        match admitted {
            Admit::Duplicate => {
                self.metrics.record_duplicate();
                tracing::trace!(correlation_id = %id, seq, "dropping duplicate envelope");
            }
            Admit::Buffered => {}
            Admit::Overflow => {
                if self.claim(&id) {
                    self.metrics.record_call_failed();
                    tokio::spawn(self.clone().finish(
                        call,
                        Status::internal("request reorder window exceeded"),
                        Closer::Other,
                    ));
                }
            }
            Admit::Ready(envelopes) => {
                for envelope in envelopes {
                    self.apply(&call, envelope);
                }
            }
        }
    }

    fn apply(self: &Arc<Self>, call: &Arc<ServerCall>, envelope: Envelope) {
        match envelope.kind {
            Kind::Headers => self.start_call(call, envelope.metadata),
            Kind::Message => self.feed(call, envelope.payload.unwrap_or_default()),
            Kind::HalfClose => {
                call.state.lock().requests = None;
            }
            Kind::Status => {}
        }
    }

    fn start_call(self: &Arc<Self>, call: &Arc<ServerCall>, headers: Metadata) {
        let id = call.id;
        if call.state.lock().phase != ServerPhase::Embryonic {
            tracing::warn!(correlation_id = %id, "ignoring duplicate request headers");
            return;
        }
        let Some(reply_to) = headers.get_str(REPLY_TO_KEY).map(str::to_string) else {
            tracing::warn!(correlation_id = %id, "request without reply topic");
            if self.claim(&id) {
                call.close(Closer::Other);
                self.metrics.record_call_failed();
            }
            return;
        };
        call.state.lock().reply_to = Some(reply_to);

        let method = headers.get_str(METHOD_KEY).unwrap_or_default().to_string();
        let Some(entry) = self.table.lookup(&method) else {
            tracing::debug!(correlation_id = %id, method = %method, "unknown method");
            if self.claim(&id) {
                self.metrics.record_call_failed();
                tokio::spawn(self.clone().finish(
                    call.clone(),
                    Status::unimplemented(format!("unknown method {:?}", method)),
                    Closer::Other,
                ));
            }
            return;
        };

        let deadline = headers
            .get_str(TIMEOUT_KEY)
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = RequestContext {
            correlation_id: id,
            method,
            metadata: headers,
            deadline,
        };
        let outlet = ResponseOutlet {
            shared: self.clone(),
            call: call.clone(),
        };
        let handler = entry.invoke(ctx, rx, outlet);

        self.metrics.record_call_started();
        tracing::debug!(correlation_id = %id, "dispatching call");

        // Spawned under the lock so neither task can close the call before
        // its handles are stored.
        let mut state = call.state.lock();
        state.phase = ServerPhase::Running;
        state.kind = entry.kind();
        state.requests = Some(tx);
        state.task = Some(tokio::spawn(run_handler(
            self.clone(),
            call.clone(),
            handler,
        )));
        state.timer = deadline.map(|deadline| {
            tokio::spawn(server_deadline(self.clone(), call.clone(), deadline))
        });
    }

    /// Hand one request payload to the handler.
    fn feed(&self, call: &Arc<ServerCall>, payload: Bytes) {
        let mut state = call.state.lock();
        if state.phase != ServerPhase::Running {
            tracing::trace!(correlation_id = %call.id, "dropping message for call without handler");
            return;
        }
        let sent = match &state.requests {
            Some(tx) => tx.send(payload),
            None => {
                tracing::trace!(correlation_id = %call.id, "dropping message after end of requests");
                return;
            }
        };
        if sent.is_err() {
            tracing::trace!(correlation_id = %call.id, "handler stopped reading requests");
            state.requests = None;
        } else if !state.kind.client_streaming() {
            state.requests = None;
        }
    }

    /// End a claimed call and publish its status.
    async fn finish(self: Arc<Self>, call: Arc<ServerCall>, status: Status, closer: Closer) {
        let Some((reply_to, seq)) = call.close(closer) else {
            return;
        };
        tracing::debug!(
            correlation_id = %call.id,
            code = %status.code(),
            message = status.message(),
            "call finished"
        );
        let envelope = Envelope::status(call.id, seq, status, Metadata::new());
        if let Err(e) = self.publisher.publish(&reply_to, &envelope).await {
            tracing::warn!(correlation_id = %call.id, error = %e, "failed to publish status");
        }
    }

    /// Drop embryonic calls whose HEADERS never arrived.
    fn sweep_orphans(&self) {
        let now = Instant::now();
        for (id, call) in self.calls.snapshot() {
            let orphaned = call.state.lock().phase == ServerPhase::Embryonic
                && now.duration_since(call.first_seen) >= self.config.orphan_timeout;
            if orphaned && self.claim(&id) {
                let pending = call.state.lock().reorder.pending();
                call.close(Closer::Other);
                self.metrics.record_unroutable();
                tracing::debug!(correlation_id = %id, pending, "dropped orphaned call");
            }
        }
    }
}

async fn run_handler(
    shared: Arc<DispatcherShared>,
    call: Arc<ServerCall>,
    handler: BoxFuture<'static, Result<(), Status>>,
) {
    let result = AssertUnwindSafe(handler)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(Status::internal("handler panicked")));
    if shared.claim(&call.id) {
        shared.metrics.record_call_completed();
        let status = match result {
            Ok(()) => Status::ok(),
            Err(status) => status,
        };
        shared.finish(call, status, Closer::Handler).await;
    }
}

async fn server_deadline(shared: Arc<DispatcherShared>, call: Arc<ServerCall>, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if shared.claim(&call.id) {
        shared.metrics.record_call_cancelled();
        shared
            .finish(
                call,
                Status::deadline_exceeded("deadline exceeded"),
                Closer::Timer,
            )
            .await;
    }
}

/// Resolves once shutdown is requested or the dispatcher is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn request_loop<S: Subscription>(
    shared: Arc<DispatcherShared>,
    mut subscription: S,
    topic: String,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            received = subscription.receive() => received,
        };
        let message = match received {
            Ok(message) => message,
            Err(TransportError::Closed) => {
                tracing::debug!(topic = %topic, "request subscription closed by broker");
                break;
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "request receive failed");
                tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                continue;
            }
        };

        if *shutdown.borrow() {
            // Leave it for another dispatcher on the same subscription.
            if let Err(e) = subscription.negative_acknowledge(&message.id).await {
                tracing::debug!(topic = %topic, error = %e, "negative acknowledge failed");
            }
            break;
        }

        shared.metrics.record_received();
        match Envelope::decode(&message.payload) {
            Ok(envelope) => shared.handle(envelope),
            Err(e) => {
                shared.metrics.record_malformed();
                tracing::warn!(topic = %topic, error = %e, "dropping malformed envelope");
            }
        }
        if let Err(e) = subscription.acknowledge(&message.id).await {
            tracing::debug!(topic = %topic, error = %e, "acknowledge failed");
        }
    }
    tracing::debug!(topic = %topic, "request loop stopped");
}

async fn orphan_sweeper(shared: Arc<DispatcherShared>) {
    let period = (shared.config.orphan_timeout / 2).max(MIN_SWEEP_PERIOD);
    let mut ticks = tokio::time::interval(period);
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticks.tick() => shared.sweep_orphans(),
        }
    }
}

/// Serves a [`ServiceTable`] from request topics.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

/// Tasks started by one `serve` call.
pub struct ServeHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ServeHandle {
    /// Wait for the delivery loops to stop after shutdown.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

impl Dispatcher {
    pub fn new<P: TopicProducer>(producer: P, table: ServiceTable, config: DispatcherConfig) -> Self {
        let metrics = Arc::new(RpcMetrics::new());
        let publisher = Publisher::new(producer, config.publish_timeout, metrics.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(DispatcherShared {
                table,
                topics: config.topics(),
                tombstones: Mutex::new(Tombstones::new(config.tombstone_capacity)),
                config,
                publisher,
                calls: CorrelationRegistry::new(),
                metrics,
                shutdown,
            }),
        }
    }

    /// Serve every service in the table until shutdown.
    pub async fn serve<C: TopicConsumer>(&self, consumer: &C) -> Result<ServeHandle, DispatchError> {
        if self.shared.table.is_empty() {
            return Err(DispatchError::NoServices);
        }
        let services: Vec<String> = self.shared.table.services().map(str::to_string).collect();
        let mut tasks = Vec::with_capacity(services.len() + 1);
        for service in &services {
            tasks.push(self.spawn_request_loop(consumer, service).await?);
        }
        tasks.push(tokio::spawn(orphan_sweeper(self.shared.clone())));
        Ok(ServeHandle { tasks })
    }

    /// Serve a single service of the table until shutdown.
    pub async fn serve_service<C: TopicConsumer>(
        &self,
        consumer: &C,
        service: &str,
    ) -> Result<ServeHandle, DispatchError> {
        if !self.shared.table.services().any(|s| s == service) {
            return Err(DispatchError::UnknownService(service.to_string()));
        }
        let tasks = vec![
            self.spawn_request_loop(consumer, service).await?,
            tokio::spawn(orphan_sweeper(self.shared.clone())),
        ];
        Ok(ServeHandle { tasks })
    }

    async fn spawn_request_loop<C: TopicConsumer>(
        &self,
        consumer: &C,
        service: &str,
    ) -> Result<JoinHandle<()>, DispatchError> {
        let topic = self.shared.topics.request_topic(service);
        let subscription = consumer
            .subscribe(&topic, &self.shared.config.subscription)
            .await?;
        tracing::debug!(topic = %topic, subscription = %self.shared.config.subscription, "serving");
        Ok(tokio::spawn(request_loop(
            self.shared.clone(),
            subscription,
            topic,
        )))
    }

    /// Calls seen and not yet finished, embryonic ones included.
    pub fn in_flight(&self) -> usize {
        self.shared.calls.len()
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stop consuming. Running handlers finish and publish their status.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

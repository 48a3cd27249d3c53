//! Client channel: call factory and reply-topic routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use pulsar_rpc_wire::{CorrelationId, Envelope, Status};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::call::InboundSink;
use crate::transport::Publisher;
use crate::{
    Call, CallError, CallOptions, ChannelConfig, CorrelationRegistry, MethodDescriptor,
    RpcMetrics, RpcMetricsSnapshot, Subscription, TopicConsumer, TopicNames, TopicProducer,
    TransportError,
};

/// Pause before receiving again after a transient subscription error.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) type CallRegistry = CorrelationRegistry<Arc<dyn InboundSink>>;

/// State shared by a channel and every call it created.
pub(crate) struct ChannelShared {
    pub(crate) config: ChannelConfig,
    pub(crate) topics: TopicNames,
    pub(crate) publisher: Publisher,
    pub(crate) registry: Arc<CallRegistry>,
    pub(crate) routes: Box<dyn ReplyRoutes>,
    pub(crate) metrics: Arc<RpcMetrics>,
}

/// Reference-counted reply subscriptions, one per service.
pub(crate) trait ReplyRoutes: Send + Sync {
    /// Take a reference on the service's reply subscription, opening it if
    /// needed. Returns the reply topic.
    fn acquire<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<String, TransportError>>;

    fn release(&self, service: &str);

    fn active(&self) -> usize;

    /// Stop every reply loop and refuse new acquisitions.
    fn close(&self);
}

struct Route {
    refs: usize,
    topic: String,
    /// Dropping this stops the reply loop.
    _stop: oneshot::Sender<()>,
}

struct RouteTable<C: TopicConsumer> {
    consumer: C,
    topics: TopicNames,
    client_id: String,
    registry: Arc<CallRegistry>,
    metrics: Arc<RpcMetrics>,
    routes: Mutex<HashMap<String, Route>>,
    closed: AtomicBool,
}

impl<C: TopicConsumer> RouteTable<C> {
    async fn acquire_route(&self, service: &str) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        {
            let mut routes = self.routes.lock();
            if let Some(route) = routes.get_mut(service) {
                route.refs += 1;
                return Ok(route.topic.clone());
            }
        }

        let topic = self.topics.reply_topic(service, &self.client_id);
        let subscription = self.consumer.subscribe(&topic, &self.client_id).await?;

        let mut routes = self.routes.lock();
        if let Some(route) = routes.get_mut(service) {
            // Another call opened the route while we were subscribing.
            route.refs += 1;
            return Ok(route.topic.clone());
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(reply_loop(
            subscription,
            topic.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            stop_rx,
        ));
        tracing::debug!(topic = %topic, "opened reply subscription");
        routes.insert(
            service.to_string(),
            Route {
                refs: 1,
                topic: topic.clone(),
                _stop: stop_tx,
            },
        );
        Ok(topic)
    }
}

impl<C: TopicConsumer> ReplyRoutes for RouteTable<C> {
    fn acquire<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(self.acquire_route(service))
    }

    fn release(&self, service: &str) {
        let mut routes = self.routes.lock();
        let Some(route) = routes.get_mut(service) else {
            return;
        };
        route.refs = route.refs.saturating_sub(1);
        if route.refs == 0 {
            let topic = route.topic.clone();
            routes.remove(service);
            tracing::debug!(topic = %topic, "closing reply subscription");
        }
    }

    fn active(&self) -> usize {
        self.routes.lock().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.routes.lock().clear();
    }
}

/// Reads one reply topic and routes envelopes to calls by correlation id.
async fn reply_loop<S: Subscription>(
    mut subscription: S,
    topic: String,
    registry: Arc<CallRegistry>,
    metrics: Arc<RpcMetrics>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = &mut stop => break,
            received = subscription.receive() => received,
        };
        let message = match message {
            Ok(message) => message,
            Err(TransportError::Closed) => {
                tracing::debug!(topic = %topic, "reply subscription closed by broker");
                break;
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "reply receive failed");
                tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                continue;
            }
        };

        metrics.record_received();
        match Envelope::decode(&message.payload) {
            Ok(envelope) => {
                let id = envelope.correlation_id;
                match registry.lookup(&id) {
                    Some(call) => call.deliver(envelope),
                    None => {
                        metrics.record_unroutable();
                        tracing::trace!(
                            topic = %topic,
                            correlation_id = %id,
                            kind = %envelope.kind,
                            "dropping envelope for unknown call"
                        );
                    }
                }
            }
            Err(e) => {
                metrics.record_malformed();
                tracing::warn!(topic = %topic, error = %e, "dropping malformed envelope");
            }
        }

        if let Err(e) = subscription.acknowledge(&message.id).await {
            tracing::debug!(topic = %topic, error = %e, "acknowledge failed");
        }
    }
}

/// Originates calls to services reachable through one broker namespace.
///
/// Creating a channel performs no I/O. Reply subscriptions are opened on the
/// first started call to a service and shared by all of this channel's calls
/// to it.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn new<P, C>(producer: P, consumer: C, config: ChannelConfig) -> Self
    where
        P: TopicProducer,
        C: TopicConsumer,
    {
        let metrics = Arc::new(RpcMetrics::new());
        let registry = Arc::new(CallRegistry::new());
        let topics = config.topics();
        let routes = RouteTable {
            consumer,
            topics: topics.clone(),
            client_id: config.client_id.clone(),
            registry: registry.clone(),
            metrics: metrics.clone(),
            routes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        let publisher = Publisher::new(producer, config.publish_timeout, metrics.clone());
        Self {
            shared: Arc::new(ChannelShared {
                config,
                topics,
                publisher,
                registry,
                routes: Box::new(routes),
                metrics,
            }),
        }
    }

    /// Create a call. Allocates a correlation id; no I/O.
    pub fn new_call<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        options: CallOptions,
    ) -> Call<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let deadline = options.deadline().or_else(|| {
            self.shared
                .config
                .default_deadline
                .map(|timeout| Instant::now() + timeout)
        });
        Call::new(self.shared.clone(), descriptor.clone(), deadline)
    }

    /// The namespace this channel's topics live under.
    pub fn authority(&self) -> Result<&str, CallError> {
        self.shared
            .topics
            .namespace()
            .ok_or(CallError::UnsupportedOperation("channel has no namespace"))
    }

    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    /// Calls started and not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_registered(&self, id: &CorrelationId) -> bool {
        self.shared.registry.contains(id)
    }

    /// Reply subscriptions currently open.
    pub fn reply_subscriptions(&self) -> usize {
        self.shared.routes.active()
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Fail every live call with `UNAVAILABLE` and stop all reply loops.
    /// Calls started afterwards fail with `UNAVAILABLE`.
    pub async fn shutdown(&self) {
        self.shared.routes.close();
        let calls = self.shared.registry.snapshot();
        tracing::debug!(live_calls = calls.len(), "shutting down channel");
        for (_, call) in calls {
            call.abort(Status::unavailable("channel shut down")).await;
        }
    }
}

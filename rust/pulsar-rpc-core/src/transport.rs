//! Topic transport capabilities.
//!
//! The core does not talk to a broker directly. Anything that can publish
//! bytes with headers to a named topic and hand back a delivery id
//! ([`TopicProducer`]), and open subscriptions that yield messages which are
//! then acknowledged or negatively acknowledged ([`TopicConsumer`],
//! [`Subscription`]), can carry RPC traffic. Delivery is assumed to be
//! at-least-once with no ordering guarantee.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use pulsar_rpc_wire::Envelope;

use crate::{RpcMetrics, TransportError};

/// Broker header carrying the envelope kind, for broker-side tooling.
pub const KIND_HEADER: &str = "rpc-kind";

/// Broker-assigned identity of one delivered message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(Bytes);

impl MessageId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn from_u64(val: u64) -> Self {
        Self(Bytes::copy_from_slice(&val.to_le_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A message to publish.
#[derive(Clone, Debug, Default)]
pub struct OutboundMessage {
    /// Routing key. Set to the correlation id so key-aware brokers keep one
    /// call's envelopes on one partition.
    pub key: Option<String>,
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self {
            key: Some(envelope.correlation_id.to_hex()),
            headers: vec![(KIND_HEADER.to_string(), envelope.kind.as_str().to_string())],
            payload: envelope.encode(),
        }
    }
}

/// A message received from a subscription.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub id: MessageId,
    pub topic: String,
    pub key: Option<String>,
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
    /// How many times the broker delivered this message before.
    pub redelivery_count: u32,
}

/// Publish side of a broker.
pub trait TopicProducer: Send + Sync + 'static {
    /// Publish one message and wait for the broker's acknowledgement.
    fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<MessageId, TransportError>> + Send;
}

/// Subscribe side of a broker.
pub trait TopicConsumer: Send + Sync + 'static {
    type Subscription: Subscription;

    /// Attach to `topic` under `subscription`. Consumers sharing a
    /// subscription name split the messages between them; distinct names each
    /// see every message.
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> impl Future<Output = Result<Self::Subscription, TransportError>> + Send;
}

/// An open subscription. Dropping it detaches from the topic.
pub trait Subscription: Send + 'static {
    /// Wait for the next message.
    fn receive(&mut self) -> impl Future<Output = Result<InboundMessage, TransportError>> + Send;

    fn acknowledge(
        &mut self,
        id: &MessageId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ask the broker to redeliver the message, possibly to another consumer.
    fn negative_acknowledge(
        &mut self,
        id: &MessageId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl<P: TopicProducer> TopicProducer for Arc<P> {
    fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<MessageId, TransportError>> + Send {
        (**self).publish(topic, message)
    }
}

impl<C: TopicConsumer> TopicConsumer for Arc<C> {
    type Subscription = C::Subscription;

    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> impl Future<Output = Result<Self::Subscription, TransportError>> + Send {
        (**self).subscribe(topic, subscription)
    }
}

/// Object-safe view of a [`TopicProducer`].
trait DynProducer: Send + Sync {
    fn publish_boxed<'a>(
        &'a self,
        topic: &'a str,
        message: OutboundMessage,
    ) -> BoxFuture<'a, Result<MessageId, TransportError>>;
}

impl<P: TopicProducer> DynProducer for P {
    fn publish_boxed<'a>(
        &'a self,
        topic: &'a str,
        message: OutboundMessage,
    ) -> BoxFuture<'a, Result<MessageId, TransportError>> {
        Box::pin(self.publish(topic, message))
    }
}

/// Envelope publisher shared by every call of a channel or dispatcher.
#[derive(Clone)]
pub(crate) struct Publisher {
    producer: Arc<dyn DynProducer>,
    timeout: Duration,
    metrics: Arc<RpcMetrics>,
}

impl Publisher {
    pub(crate) fn new<P: TopicProducer>(
        producer: P,
        timeout: Duration,
        metrics: Arc<RpcMetrics>,
    ) -> Self {
        Self {
            producer: Arc::new(producer),
            timeout,
            metrics,
        }
    }

    /// Publish one envelope, bounded by the publish timeout.
    pub(crate) async fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<MessageId, TransportError> {
        let message = OutboundMessage::for_envelope(envelope);
        let result =
            tokio::time::timeout(self.timeout, self.producer.publish_boxed(topic, message)).await;
        match result {
            Ok(Ok(id)) => {
                self.metrics.record_sent();
                tracing::trace!(
                    topic,
                    correlation_id = %envelope.correlation_id,
                    kind = %envelope.kind,
                    seq = envelope.seq,
                    "published envelope"
                );
                Ok(id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

//! Scripted transport and listener for unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use pulsar_rpc_wire::{Envelope, Metadata, Status};
use tokio::sync::mpsc;

use crate::{
    CallListener, InboundMessage, MessageId, OutboundMessage, Subscription, TopicConsumer,
    TopicProducer, TransportError,
};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every publish; can be told to fail.
#[derive(Clone, Default)]
pub(crate) struct RecordingProducer {
    published: Arc<Mutex<Vec<(String, Envelope)>>>,
    failing: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl RecordingProducer {
    pub(crate) fn published(&self) -> Vec<(String, Envelope)> {
        self.published.lock().clone()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl TopicProducer for RecordingProducer {
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Io("broker unreachable".to_string()));
        }
        let envelope = Envelope::decode(&message.payload)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.published.lock().push((topic.to_string(), envelope));
        Ok(MessageId::from_u64(
            self.next_id.fetch_add(1, Ordering::SeqCst),
        ))
    }
}

/// Consumer whose subscriptions are fed by the test.
#[derive(Clone, Default)]
pub(crate) struct ScriptedConsumer {
    feeds: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>>,
    subscribes: Arc<AtomicU64>,
}

impl ScriptedConsumer {
    /// Deliver `envelope` on `topic`. Returns false if nobody subscribed.
    pub(crate) fn push(&self, topic: &str, envelope: &Envelope) -> bool {
        let feeds = self.feeds.lock();
        let Some(feed) = feeds.get(topic) else {
            return false;
        };
        feed.send(InboundMessage {
            id: MessageId::from_u64(envelope.seq),
            topic: topic.to_string(),
            key: Some(envelope.correlation_id.to_hex()),
            headers: Vec::new(),
            payload: envelope.encode(),
            redelivery_count: 0,
        })
        .is_ok()
    }

    pub(crate) fn subscribe_count(&self) -> u64 {
        self.subscribes.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedSubscription {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl TopicConsumer for ScriptedConsumer {
    type Subscription = ScriptedSubscription;

    async fn subscribe(
        &self,
        topic: &str,
        _subscription: &str,
    ) -> Result<ScriptedSubscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(topic.to_string(), tx);
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSubscription { rx })
    }
}

impl Subscription for ScriptedSubscription {
    async fn receive(&mut self) -> Result<InboundMessage, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn acknowledge(&mut self, _id: &MessageId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn negative_acknowledge(&mut self, _id: &MessageId) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Seen<T> {
    Headers(Metadata),
    Message(T),
    Close(Status),
}

/// Listener forwarding callbacks to the test.
pub(crate) struct RecordingListener<T> {
    tx: mpsc::UnboundedSender<Seen<T>>,
}

impl<T> RecordingListener<T> {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Seen<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<T: Send + 'static> CallListener<T> for RecordingListener<T> {
    fn on_headers(&mut self, headers: Metadata) {
        let _ = self.tx.send(Seen::Headers(headers));
    }

    fn on_message(&mut self, message: T) {
        let _ = self.tx.send(Seen::Message(message));
    }

    fn on_close(&mut self, status: Status, _trailers: Metadata) {
        let _ = self.tx.send(Seen::Close(status));
    }
}

pub(crate) const CLIENT_ID: &str = "c1";

pub(crate) fn test_channel() -> (crate::Channel, RecordingProducer, ScriptedConsumer) {
    let producer = RecordingProducer::default();
    let consumer = ScriptedConsumer::default();
    let channel = crate::Channel::new(
        producer.clone(),
        consumer.clone(),
        crate::ChannelConfig::default().with_client_id(CLIENT_ID),
    );
    (channel, producer, consumer)
}

pub(crate) fn say(kind: crate::MethodKind) -> crate::MethodDescriptor<String, String> {
    crate::MethodDescriptor::new(
        "Echo",
        "Say",
        kind,
        pulsar_rpc_codec::json::<String>(),
        pulsar_rpc_codec::json::<String>(),
    )
}

pub(crate) fn json_payload(value: &str) -> bytes::Bytes {
    use pulsar_rpc_codec::Marshaller;
    pulsar_rpc_codec::json::<String>()
        .encode(&value.to_string())
        .expect("encode")
}

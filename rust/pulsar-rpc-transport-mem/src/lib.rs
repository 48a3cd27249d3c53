#![deny(unsafe_code)]

//! In-process topic broker.
//!
//! [`MemBroker`] implements the producer and consumer capabilities of
//! `pulsar-rpc-core` with the delivery semantics of a Pulsar shared
//! subscription:
//!
//! - every named subscription on a topic receives every message published
//!   after it was created;
//! - consumers attached under the same subscription name split its messages.
//!   Keyed messages stick to one consumer per key while the set of consumers
//!   is unchanged, so one call's envelopes reach one dispatcher; unkeyed
//!   messages go round-robin;
//! - a message stays unacknowledged until its consumer acknowledges it. A
//!   negative acknowledgement, or the consumer going away, redelivers it with
//!   an incremented redelivery count;
//! - messages for a subscription with no attached consumer wait in its
//!   backlog.
//!
//! A [`FaultInjector`] can drop, duplicate, delay and reorder published
//! messages, which is how the RPC layer's tolerance of at-least-once,
//! unordered delivery gets exercised.

mod fault;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use pulsar_rpc_core::{
    InboundMessage, MessageId, OutboundMessage, Subscription, TopicConsumer, TopicProducer,
    TransportError,
};
use tokio::sync::mpsc;

pub use fault::{FaultAction, FaultConfig, FaultInjector};

#[derive(Clone, Debug)]
struct Delivery {
    id: u64,
    key: Option<String>,
    headers: Vec<(String, String)>,
    payload: Bytes,
    redelivery_count: u32,
}

struct Consumer {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// One named subscription on a topic.
#[derive(Default)]
struct Group {
    consumers: Vec<Consumer>,
    cursor: usize,
    backlog: VecDeque<Delivery>,
    /// Message id to (consumer id, message).
    unacked: HashMap<u64, (u64, Delivery)>,
}

impl Group {
    /// Hand `delivery` to the next live consumer, or park it in the backlog.
    /// Returns true if a consumer took it.
    fn dispatch(&mut self, mut delivery: Delivery) -> bool {
        while !self.consumers.is_empty() {
            let index = self.pick(delivery.key.as_deref());
            let consumer_id = self.consumers[index].id;
            let copy = delivery.clone();
            match self.consumers[index].tx.send(delivery) {
                Ok(()) => {
                    self.unacked.insert(copy.id, (consumer_id, copy));
                    return true;
                }
                Err(mpsc::error::SendError(returned)) => {
                    delivery = returned;
                    self.consumers.remove(index);
                }
            }
        }
        self.backlog.push_back(delivery);
        false
    }

    fn pick(&mut self, key: Option<&str>) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.consumers.len() as u64) as usize
            }
            None => {
                let index = self.cursor % self.consumers.len();
                self.cursor = self.cursor.wrapping_add(1);
                index
            }
        }
    }
}

#[derive(Default)]
struct Topic {
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    delayed: AtomicU64,
    redelivered: AtomicU64,
}

/// Broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages accepted from producers.
    pub published: u64,
    /// Messages handed to a consumer, redeliveries included.
    pub delivered: u64,
    /// Messages lost to fault injection.
    pub dropped: u64,
    /// Extra copies created by fault injection.
    pub duplicated: u64,
    /// Messages held back by fault injection.
    pub delayed: u64,
    /// Redeliveries after a negative acknowledgement or a lost consumer.
    pub redelivered: u64,
}

struct BrokerInner {
    topics: Mutex<HashMap<String, Topic>>,
    faults: FaultInjector,
    next_message: AtomicU64,
    next_consumer: AtomicU64,
    closed: AtomicBool,
    counters: Counters,
}

impl BrokerInner {
    fn route(&self, topic: &str, delivery: Delivery) {
        let mut topics = self.topics.lock();
        let Some(topic_state) = topics.get_mut(topic) else {
            tracing::trace!(topic, message = delivery.id, "no subscription, message discarded");
            return;
        };
        for group in topic_state.groups.values_mut() {
            if group.dispatch(delivery.clone()) {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn attach(&self, topic: &str, subscription: &str) -> (u64, mpsc::UnboundedReceiver<Delivery>) {
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock();
        let group = topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(subscription.to_string())
            .or_default();
        group.consumers.push(Consumer { id, tx });
        let backlog = std::mem::take(&mut group.backlog);
        for delivery in backlog {
            if group.dispatch(delivery) {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        (id, rx)
    }

    /// Remove a consumer and redeliver what it held. `unseen` are messages
    /// sent to it that it never received; their redelivery count stays.
    fn detach(&self, topic: &str, subscription: &str, consumer: u64, unseen: &HashSet<u64>) {
        let mut topics = self.topics.lock();
        let Some(group) = topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(subscription))
        else {
            return;
        };
        group.consumers.retain(|c| c.id != consumer);

        let mut held: Vec<u64> = group
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == consumer)
            .map(|(id, _)| *id)
            .collect();
        held.sort_unstable();
        for id in held {
            let Some((_, mut delivery)) = group.unacked.remove(&id) else {
                continue;
            };
            if !unseen.contains(&id) {
                delivery.redelivery_count += 1;
                self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
            }
            if group.dispatch(delivery) {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn acknowledge(&self, topic: &str, subscription: &str, consumer: u64, message: u64) {
        let mut topics = self.topics.lock();
        let Some(group) = topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(subscription))
        else {
            return;
        };
        if group
            .unacked
            .get(&message)
            .is_some_and(|(owner, _)| *owner == consumer)
        {
            group.unacked.remove(&message);
        }
    }

    fn negative_acknowledge(&self, topic: &str, subscription: &str, consumer: u64, message: u64) {
        let mut topics = self.topics.lock();
        let Some(group) = topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(subscription))
        else {
            return;
        };
        if !group
            .unacked
            .get(&message)
            .is_some_and(|(owner, _)| *owner == consumer)
        {
            return;
        }
        let Some((_, mut delivery)) = group.unacked.remove(&message) else {
            return;
        };
        delivery.redelivery_count += 1;
        self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
        if group.dispatch(delivery) {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// In-process broker. Clones share the same topics.
#[derive(Clone)]
pub struct MemBroker {
    inner: Arc<BrokerInner>,
}

impl MemBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                faults: FaultInjector::new(),
                next_message: AtomicU64::new(0),
                next_consumer: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn with_faults(config: FaultConfig) -> Self {
        let broker = Self::new();
        broker.inner.faults.configure(&config);
        broker
    }

    /// Fault settings, adjustable while the broker runs.
    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }

    /// Close the broker: publishes and subscribes fail, open subscriptions
    /// report [`TransportError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Dropping the groups drops every consumer sender.
        self.inner.topics.lock().clear();
        tracing::debug!("broker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Messages waiting for a consumer on `subscription`.
    pub fn backlog(&self, topic: &str, subscription: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.groups.get(subscription))
            .map_or(0, |g| g.backlog.len())
    }

    /// Messages handed to a consumer of `subscription` and not yet
    /// acknowledged.
    pub fn unacked(&self, topic: &str, subscription: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.groups.get(subscription))
            .map_or(0, |g| g.unacked.len())
    }

    /// Consumers currently attached to `subscription`.
    pub fn consumers(&self, topic: &str, subscription: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.groups.get(subscription))
            .map_or(0, |g| g.consumers.len())
    }

    /// Delete a subscription and its backlog.
    pub fn unsubscribe(&self, topic: &str, subscription: &str) -> bool {
        self.inner
            .topics
            .lock()
            .get_mut(topic)
            .and_then(|t| t.groups.remove(subscription))
            .is_some()
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            duplicated: c.duplicated.load(Ordering::Relaxed),
            delayed: c.delayed.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
        }
    }

    fn next_delivery(&self, message: &OutboundMessage) -> Delivery {
        Delivery {
            id: self.inner.next_message.fetch_add(1, Ordering::Relaxed),
            key: message.key.clone(),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
            redelivery_count: 0,
        }
    }
}

impl Default for MemBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBroker")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TopicProducer for MemBroker {
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let delivery = self.next_delivery(&message);
        let id = MessageId::from_u64(delivery.id);
        let counters = &self.inner.counters;
        counters.published.fetch_add(1, Ordering::Relaxed);

        match self.inner.faults.check() {
            FaultAction::Pass => self.inner.route(topic, delivery),
            FaultAction::Drop => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic, message = delivery.id, "fault: dropping message");
            }
            FaultAction::Duplicate => {
                counters.duplicated.fetch_add(1, Ordering::Relaxed);
                let copy = self.next_delivery(&message);
                tracing::debug!(topic, message = delivery.id, "fault: duplicating message");
                self.inner.route(topic, delivery);
                self.inner.route(topic, copy);
            }
            FaultAction::Delay(delay) => {
                counters.delayed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(topic, message = delivery.id, ?delay, "fault: delaying message");
                let inner = self.inner.clone();
                let topic = topic.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !inner.closed.load(Ordering::Acquire) {
                        inner.route(&topic, delivery);
                    }
                });
            }
        }
        Ok(id)
    }
}

impl TopicConsumer for MemBroker {
    type Subscription = MemSubscription;

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<MemSubscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let (consumer, rx) = self.inner.attach(topic, subscription);
        tracing::debug!(topic, subscription, consumer, "consumer attached");
        Ok(MemSubscription {
            broker: self.inner.clone(),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            consumer,
            rx,
        })
    }
}

/// A consumer attached to one subscription of a [`MemBroker`] topic.
pub struct MemSubscription {
    broker: Arc<BrokerInner>,
    topic: String,
    subscription: String,
    consumer: u64,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl MemSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

fn message_number(id: &MessageId) -> Result<u64, TransportError> {
    let bytes: [u8; 8] = id
        .as_bytes()
        .try_into()
        .map_err(|_| TransportError::Rejected("foreign message id".to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

impl Subscription for MemSubscription {
    async fn receive(&mut self) -> Result<InboundMessage, TransportError> {
        let delivery = self.rx.recv().await.ok_or(TransportError::Closed)?;
        Ok(InboundMessage {
            id: MessageId::from_u64(delivery.id),
            topic: self.topic.clone(),
            key: delivery.key,
            headers: delivery.headers,
            payload: delivery.payload,
            redelivery_count: delivery.redelivery_count,
        })
    }

    async fn acknowledge(&mut self, id: &MessageId) -> Result<(), TransportError> {
        let message = message_number(id)?;
        self.broker
            .acknowledge(&self.topic, &self.subscription, self.consumer, message);
        Ok(())
    }

    async fn negative_acknowledge(&mut self, id: &MessageId) -> Result<(), TransportError> {
        let message = message_number(id)?;
        self.broker
            .negative_acknowledge(&self.topic, &self.subscription, self.consumer, message);
        Ok(())
    }
}

impl Drop for MemSubscription {
    fn drop(&mut self) {
        self.rx.close();
        let mut unseen = HashSet::new();
        while let Ok(delivery) = self.rx.try_recv() {
            unseen.insert(delivery.id);
        }
        self.broker
            .detach(&self.topic, &self.subscription, self.consumer, &unseen);
        tracing::debug!(
            topic = %self.topic,
            subscription = %self.subscription,
            consumer = self.consumer,
            "consumer detached"
        );
    }
}

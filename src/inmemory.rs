//! In-process broker for tests and local pipelines.
//!
//! [`InMemoryBroker`] models the subset of RabbitMQ the retry topology relies
//! on:
//!
//! - topic and fanout exchanges, including internal exchanges
//! - alternate exchanges for messages no binding matches
//! - per-message expiration and queue TTL, expiring from the head of a queue
//! - dead-lettering of expired and rejected messages, keeping the routing key
//! - forwarding links that move every message of a queue onto an exchange
//!
//! Time is read from [`tokio::time::Instant`], so a paused test runtime
//! drives expirations with [`tokio::time::advance`]. Expirations and links are
//! applied lazily whenever the broker is touched, or explicitly with
//! [`settle`](InMemoryBroker::settle).

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    Envelope,
    consumer::{Acknowledge, Delivery, Subscribe},
    topology::{
        BindingSpec, DeclareTopology, ExchangeKind, ExchangeSpec, ForwardingLink,
        ForwardingLinks, QueueSpec,
    },
    transport::{DeliveryProperties, Sender, ToBytes},
};

/// A cycle of zero-TTL queues would otherwise never settle.
const MAX_SETTLE_PASSES: usize = 64;

/// Shared in-process broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    exchanges: BTreeMap<String, ExchangeSpec>,
    queues: BTreeMap<String, QueueState>,
    bindings: BTreeSet<BindingSpec>,
    links: BTreeMap<String, ForwardingLink>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_tag: u64,
    prefetch: Option<u16>,
}

struct QueueState {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
    expiration: Option<Duration>,
    enqueued_at: Instant,
}

impl StoredMessage {
    fn deadline(&self, ttl: Option<Duration>) -> Option<Instant> {
        let lifetime = match (self.expiration, ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        lifetime.map(|lifetime| self.enqueued_at + lifetime)
    }

    fn dead_lettered(mut self) -> Self {
        self.expiration = None;
        self.enqueued_at = Instant::now();
        self
    }
}

/// Declared entities, comparable across calls.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    pub exchanges: BTreeMap<String, ExchangeSpec>,
    pub queues: BTreeMap<String, QueueSpec>,
    pub bindings: BTreeSet<BindingSpec>,
    pub links: BTreeMap<String, ForwardingLink>,
}

impl InMemoryBroker {
    /// Publish raw bytes, bypassing envelope validation.
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), InMemoryBrokerError> {
        let message = StoredMessage {
            body: body.into(),
            routing_key: routing_key.to_owned(),
            expiration: None,
            enqueued_at: Instant::now(),
        };
        let mut state = self.state.lock().await;
        state.publish(exchange, message)?;
        state.settle();
        Ok(())
    }

    /// Apply due expirations and forwarding links.
    pub async fn settle(&self) {
        self.state.lock().await.settle();
    }

    /// Number of ready messages in `queue`, 0 if it does not exist.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let mut state = self.state.lock().await;
        state.settle();
        state.queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Decode the ready messages of `queue` without consuming them.
    pub async fn peek(&self, queue: &str) -> Vec<Envelope> {
        let mut state = self.state.lock().await;
        state.settle();
        state
            .queues
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .filter_map(|m| Envelope::from_slice(&m.body).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled.
    pub async fn unacked(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Prefetch requested by the most recent subscription.
    pub async fn prefetch(&self) -> Option<u16> {
        self.state.lock().await.prefetch
    }

    pub async fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.lock().await;
        TopologySnapshot {
            exchanges: state.exchanges.clone(),
            queues: state
                .queues
                .iter()
                .map(|(name, q)| (name.clone(), q.spec.clone()))
                .collect(),
            bindings: state.bindings.clone(),
            links: state.links.clone(),
        }
    }

    /// Subscription consuming `queue`.
    ///
    /// The delivery stream ends as soon as the queue is empty.
    pub fn subscription(&self, queue: impl Into<String>) -> InMemorySubscription {
        InMemorySubscription {
            broker: self.clone(),
            queue: queue.into(),
        }
    }

    /// Pop the head of `queue` unless `prefetch` deliveries from it are still
    /// unsettled. A prefetch of zero is unlimited, as in AMQP.
    async fn next_delivery(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Option<Delivery<InMemoryAcker>>, InMemoryBrokerError> {
        let mut state = self.state.lock().await;
        state.settle();

        let in_flight = state.unacked.values().filter(|(q, _)| q == queue).count();
        if prefetch != 0 && in_flight >= usize::from(prefetch) {
            return Ok(None);
        }

        let message = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| InMemoryBrokerError::not_found("queue", queue))?
            .messages
            .pop_front();
        let Some(message) = message else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let body = message.body.clone();
        state.unacked.insert(tag, (queue.to_owned(), message));

        Ok(Some(Delivery {
            body,
            redelivered: false,
            acker: InMemoryAcker {
                broker: self.clone(),
                tag,
            },
        }))
    }
}

impl State {
    fn publish(
        &mut self,
        exchange: &str,
        message: StoredMessage,
    ) -> Result<(), InMemoryBrokerError> {
        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| InMemoryBrokerError::not_found("exchange", exchange))?;
        if spec.internal {
            return Err(InMemoryBrokerError::access_refused(exchange));
        }
        let routed = self.route(exchange, message);
        tracing::debug!(exchange, routed, "Message published to in-memory broker");
        Ok(())
    }

    /// Deliver `message` to every queue bound to `exchange`, falling back to
    /// alternate exchanges. Returns the number of queues reached.
    fn route(&mut self, exchange: &str, message: StoredMessage) -> usize {
        let mut current = exchange.to_owned();
        let mut visited = BTreeSet::new();

        loop {
            let Some(spec) = self.exchanges.get(&current) else {
                return 0;
            };
            let targets: BTreeSet<&str> = self
                .bindings
                .iter()
                .filter(|b| {
                    b.exchange == current
                        && binding_matches(spec.kind, &b.routing_key, &message.routing_key)
                })
                .map(|b| b.queue.as_str())
                .collect();

            if !targets.is_empty() {
                let mut reached = 0;
                for name in targets {
                    if let Some(queue) = self.queues.get_mut(name) {
                        queue.messages.push_back(message.clone());
                        reached += 1;
                    }
                }
                return reached;
            }

            match spec.alternate_exchange() {
                Some(alternate) if visited.insert(current.clone()) => {
                    current = alternate.to_owned();
                }
                _ => return 0,
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage) {
        let target = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter_exchange())
            .map(str::to_owned);
        if let Some(exchange) = target {
            self.route(&exchange, message.dead_lettered());
        }
    }

    fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_PASSES {
            let expired = self.expire();
            let forwarded = self.forward();
            if !expired && !forwarded {
                return;
            }
        }
    }

    /// Dead-letter expired messages at the head of every queue.
    fn expire(&mut self) -> bool {
        let now = Instant::now();
        let mut expired = Vec::new();

        for (name, queue) in self.queues.iter_mut() {
            let ttl = queue.spec.message_ttl();
            while queue
                .messages
                .front()
                .and_then(|m| m.deadline(ttl))
                .is_some_and(|deadline| deadline <= now)
            {
                if let Some(message) = queue.messages.pop_front() {
                    expired.push((name.clone(), message));
                }
            }
        }

        let any = !expired.is_empty();
        for (queue, message) in expired {
            self.dead_letter(&queue, message);
        }
        any
    }

    /// Move every message of each link's source queue onto its destination.
    fn forward(&mut self) -> bool {
        let mut moved = Vec::new();
        for link in self.links.values() {
            if let Some(queue) = self.queues.get_mut(&link.source_queue) {
                moved.extend(
                    queue
                        .messages
                        .drain(..)
                        .map(|m| (link.destination_exchange.clone(), m)),
                );
            }
        }

        let any = !moved.is_empty();
        for (exchange, mut message) in moved {
            message.enqueued_at = Instant::now();
            self.route(&exchange, message);
        }
        any
    }
}

fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((part, key_rest))) => {
            word == part && topic_matches(rest, key_rest)
        }
        _ => false,
    }
}

#[async_trait]
impl DeclareTopology for InMemoryBroker {
    type Error = InMemoryBrokerError;

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => {
                Err(InMemoryBrokerError::precondition_failed(&exchange.name))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => {
                Err(InMemoryBrokerError::precondition_failed(&queue.name))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        spec: queue.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(InMemoryBrokerError::not_found("exchange", &binding.exchange));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(InMemoryBrokerError::not_found("queue", &binding.queue));
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange != name);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
        Ok(())
    }
}

#[async_trait]
impl ForwardingLinks for InMemoryBroker {
    type Error = InMemoryBrokerError;

    async fn create_link(&self, link: &ForwardingLink) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        match state.links.get(&link.name) {
            Some(existing) if existing != link => {
                Err(InMemoryBrokerError::precondition_failed(&link.name))
            }
            Some(_) => Ok(()),
            None => {
                state.links.insert(link.name.clone(), link.clone());
                Ok(())
            }
        }
    }

    async fn delete_link(&self, name: &str) -> Result<(), Self::Error> {
        self.state.lock().await.links.remove(name);
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> Result<bool, Self::Error> {
        Ok(self.state.lock().await.links.contains_key(name))
    }
}

#[async_trait]
impl<M> Sender<M> for InMemoryBroker
where
    M: ToBytes + Send + 'static,
{
    type Error = tower::BoxError;

    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<M>) -> Result<(), Self::Error> {
        let delivery = DeliveryProperties::from_metadata(&envelope.metadata)?;
        let message = StoredMessage {
            body: envelope.message.to_bytes().to_vec(),
            routing_key: delivery.routing_key,
            expiration: delivery.expiration,
            enqueued_at: Instant::now(),
        };

        let mut state = self.state.lock().await;
        state.publish(&delivery.exchange, message)?;
        state.settle();
        Ok(())
    }
}

/// Subscription to one queue of an [`InMemoryBroker`].
///
/// The delivery stream ends once the queue is empty or once `prefetch`
/// deliveries are held without being settled.
#[derive(Clone)]
pub struct InMemorySubscription {
    broker: InMemoryBroker,
    queue: String,
}

#[async_trait]
impl Subscribe for InMemorySubscription {
    type Error = InMemoryBrokerError;
    type Acker = InMemoryAcker;

    async fn subscribe(
        &self,
        prefetch: u16,
    ) -> Result<BoxStream<'static, Result<Delivery<InMemoryAcker>, Self::Error>>, Self::Error> {
        {
            let mut state = self.broker.state.lock().await;
            if !state.queues.contains_key(&self.queue) {
                return Err(InMemoryBrokerError::not_found("queue", &self.queue));
            }
            state.prefetch = Some(prefetch);
        }

        let broker = self.broker.clone();
        let queue = self.queue.clone();
        Ok(Box::pin(async_stream::stream! {
            loop {
                match broker.next_delivery(&queue, prefetch).await {
                    Ok(Some(delivery)) => yield Ok(delivery),
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }))
    }
}

/// Settles one in-memory delivery.
#[derive(Debug)]
pub struct InMemoryAcker {
    broker: InMemoryBroker,
    tag: u64,
}

#[async_trait]
impl Acknowledge for InMemoryAcker {
    type Error = InMemoryBrokerError;

    async fn ack(self) -> Result<(), Self::Error> {
        let mut state = self.broker.state.lock().await;
        state
            .unacked
            .remove(&self.tag)
            .ok_or(InMemoryBrokerError::unknown_delivery_tag(self.tag))?;
        Ok(())
    }

    async fn reject(self) -> Result<(), Self::Error> {
        let mut state = self.broker.state.lock().await;
        let (queue, message) = state
            .unacked
            .remove(&self.tag)
            .ok_or(InMemoryBrokerError::unknown_delivery_tag(self.tag))?;
        state.dead_letter(&queue, message);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker").finish_non_exhaustive()
    }
}

/// Error type for `InMemoryBroker` operations.
#[derive(Debug)]
pub struct InMemoryBrokerError {
    kind: InMemoryBrokerErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InMemoryBrokerErrorKind {
    NotFound { entity: &'static str, name: String },
    /// Re-declaration with different settings.
    PreconditionFailed(String),
    /// Client publish to an internal exchange.
    AccessRefused(String),
    UnknownDeliveryTag(u64),
}

impl InMemoryBrokerError {
    fn not_found(entity: &'static str, name: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::NotFound {
                entity,
                name: name.to_owned(),
            },
        }
    }

    fn precondition_failed(name: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::PreconditionFailed(name.to_owned()),
        }
    }

    fn access_refused(name: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::AccessRefused(name.to_owned()),
        }
    }

    fn unknown_delivery_tag(tag: u64) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::UnknownDeliveryTag(tag),
        }
    }

    pub fn kind(&self) -> &InMemoryBrokerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for InMemoryBrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryBrokerErrorKind::NotFound { entity, name } => {
                write!(f, "No {entity} named {name:?}")
            }
            InMemoryBrokerErrorKind::PreconditionFailed(name) => {
                write!(f, "{name:?} already declared with different settings")
            }
            InMemoryBrokerErrorKind::AccessRefused(name) => {
                write!(f, "Exchange {name:?} is internal")
            }
            InMemoryBrokerErrorKind::UnknownDeliveryTag(tag) => {
                write!(f, "Unknown delivery tag {tag}")
            }
        }
    }
}

impl std::error::Error for InMemoryBrokerError {}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::topology::{DEFAULT_REPUB_INTERVAL, Topology};

    #[test]
    fn topic_patterns() {
        let matches = |pattern, key| binding_matches(ExchangeKind::Topic, pattern, key);

        assert!(matches("email", "email"));
        assert!(!matches("email", "email.send"));
        assert!(matches("email.*", "email.send"));
        assert!(!matches("email.*", "email"));
        assert!(matches("email.#", "email"));
        assert!(matches("#", "anything.at.all"));
        assert!(matches("*.send", "sms.send"));
        assert!(!matches("*.send", "sms.receive"));
        assert!(matches("", ""));
        assert!(binding_matches(ExchangeKind::Fanout, "", "email"));
    }

    async fn provisioned() -> InMemoryBroker {
        let broker = InMemoryBroker::default();
        let topology = Topology::new(broker.clone(), broker.clone());
        topology
            .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn internal_exchanges_refuse_publishers() {
        let broker = provisioned().await;

        let err = broker
            .publish_raw("jobs.unrouted", "email", "{}")
            .await
            .unwrap_err();

        assert_eq!(
            err.kind(),
            &InMemoryBrokerErrorKind::AccessRefused("jobs.unrouted".into())
        );
    }

    #[tokio::test]
    async fn unmatched_messages_take_the_alternate_exchange() {
        let broker = provisioned().await;

        broker.publish_raw("jobs", "email", "{}").await.unwrap();

        assert_eq!(broker.queue_depth("jobs.unrouted").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_message_expiration_dead_letters_with_the_routing_key() {
        let broker = provisioned().await;
        let topology = Topology::new(broker.clone(), broker.clone());
        topology
            .provision_subscription("jobs", "email", "email")
            .await
            .unwrap();

        let envelope = Envelope::new(
            crate::Message::new("SendEmail"),
            crate::Metadata::new()
                .with("exchange", "jobs.waiting")
                .with("routing_key", "email")
                .with("expiration", 2000),
        );
        let mut sender = broker.clone();
        sender
            .send(Envelope::new(envelope.to_vec().unwrap(), envelope.metadata))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("jobs.waiting").await, 1);
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(broker.queue_depth("email").await, 0);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(broker.queue_depth("jobs.waiting").await, 0);
        assert_eq!(broker.queue_depth("email").await, 1);
    }

    #[tokio::test]
    async fn reject_dead_letters_only_with_a_dead_letter_exchange() {
        let broker = provisioned().await;
        broker
            .declare_queue(&QueueSpec::durable("plain"))
            .await
            .unwrap();
        broker
            .bind_queue(&BindingSpec::new("jobs", "plain", "plain"))
            .await
            .unwrap();
        broker.publish_raw("jobs", "plain", "{}").await.unwrap();

        let mut deliveries = broker.subscription("plain").subscribe(1).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked().await, 1);
        delivery.acker.reject().await.unwrap();

        assert_eq!(broker.unacked().await, 0);
        assert_eq!(broker.queue_depth("plain").await, 0);
        assert_eq!(broker.queue_depth("jobs.unrouted").await, 0);
    }

    #[tokio::test]
    async fn acking_twice_fails() {
        let broker = provisioned().await;
        broker
            .declare_queue(&QueueSpec::durable("plain"))
            .await
            .unwrap();
        broker
            .bind_queue(&BindingSpec::new("jobs", "plain", "#"))
            .await
            .unwrap();
        broker.publish_raw("jobs", "a", "{}").await.unwrap();

        let mut deliveries = broker.subscription("plain").subscribe(1).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        let tag = delivery.acker.tag;
        delivery.acker.ack().await.unwrap();

        let err = InMemoryAcker {
            broker: broker.clone(),
            tag,
        }
        .ack()
        .await
        .unwrap_err();
        assert_eq!(err.kind(), &InMemoryBrokerErrorKind::UnknownDeliveryTag(tag));
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn unsettled_deliveries_hold_back_the_queue_at_prefetch() {
        let broker = provisioned().await;
        broker
            .declare_queue(&QueueSpec::durable("plain"))
            .await
            .unwrap();
        broker
            .bind_queue(&BindingSpec::new("jobs", "plain", "#"))
            .await
            .unwrap();
        broker.publish_raw("jobs", "a", "{}").await.unwrap();
        broker.publish_raw("jobs", "b", "{}").await.unwrap();

        let mut deliveries = broker.subscription("plain").subscribe(1).await.unwrap();
        let held = deliveries.next().await.unwrap().unwrap();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_depth("plain").await, 1);
        assert_eq!(broker.unacked().await, 1);

        held.acker.ack().await.unwrap();
        let mut deliveries = broker.subscription("plain").subscribe(1).await.unwrap();
        assert!(deliveries.next().await.unwrap().is_ok());
        assert_eq!(broker.queue_depth("plain").await, 0);
    }

    #[tokio::test]
    async fn subscribing_to_a_missing_queue_fails() {
        let broker = InMemoryBroker::default();

        let result = broker.subscription("nowhere").subscribe(1).await;

        assert!(matches!(
            result.map(|_| ()).unwrap_err().kind(),
            InMemoryBrokerErrorKind::NotFound { entity: "queue", .. }
        ));
    }
}

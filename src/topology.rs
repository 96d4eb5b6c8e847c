//! Retry topology for a logical channel.
//!
//! A channel is a topic exchange plus three auxiliary stages that make
//! delivery retry-capable without a timer service:
//!
//! ```text
//!                 alternate-exchange                  ttl = repub interval
//!   publish ──▶ <c> ─────────────────▶ <c>.unrouted ──▶ [<c>.unrouted] ──┐
//!                ▲                                                       │ dead-letter
//!                │ forwarding link (shovel)                              ▼
//!                └──────────────────── [<c>.repub] ◀──────────────── <c>.repub
//!                ▲
//!                │ dead-letter when the per-message expiration elapses
//!   retry ──▶ <c>.waiting ──▶ [<c>.waiting] ─┘
//! ```
//!
//! - Messages nobody is bound for are parked in `<c>.unrouted` and come back
//!   to `<c>` after the republish interval, covering consumers that bind
//!   after publication.
//! - Failed jobs are republished to `<c>.waiting` with an expiration equal to
//!   the retry delay; on expiry they are dead-lettered back to `<c>` with
//!   their original routing key.
//!
//! ## Components
//!
//! - [`ChannelTopology`]: names and ordered declarations for one channel
//! - [`Topology`]: façade provisioning and decommissioning channels
//! - [`DeclareTopology`]: trait for declaring exchanges, queues and bindings
//! - [`ForwardingLinks`]: trait for managing forwarding links (shovels)
//!
//! Backends live in [`amqp`] (exchanges and queues over an AMQP channel),
//! [`management`] (everything over the RabbitMQ management API) and
//! [`crate::inmemory`].
//!
//! Provisioning is not transactional: a failed declaration aborts and may
//! leave part of the topology behind. Run
//! [`decommission_channel`](Topology::decommission_channel) to clean up.

#[cfg(feature = "rabbitmq")]
pub mod amqp;

#[cfg(feature = "management")]
pub mod management;

use std::time::Duration;

use serde_json::{Map, Value};
use tracing::instrument;
use tracing_error::SpanTrace;

/// Suffix of the stage holding messages until their retry delay elapses.
pub const WAITING_SUFFIX: &str = ".waiting";
/// Suffix of the stage capturing messages that matched no binding.
pub const UNROUTED_SUFFIX: &str = ".unrouted";
/// Suffix of the stage feeding the forwarding link.
pub const REPUB_SUFFIX: &str = ".repub";
/// Suffix appended to the repub stage name to name the forwarding link.
pub const LINK_SUFFIX: &str = ".shovel";

/// How long unroutable messages are parked before they are routed again.
pub const DEFAULT_REPUB_INTERVAL: Duration = Duration::from_secs(30);

pub const ALTERNATE_EXCHANGE: &str = "alternate-exchange";
pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const MESSAGE_TTL: &str = "x-message-ttl";

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on dot-separated routing key patterns (`*` and `#` wildcards).
    Topic,
    /// Route to every bound queue.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// Internal exchanges only receive messages from other broker entities,
    /// never from publishers.
    pub internal: bool,
    pub arguments: Map<String, Value>,
}

impl ExchangeSpec {
    /// A durable, non auto-deleting exchange.
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: Map::new(),
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn with_argument(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Name of the exchange messages go to when no binding matches.
    pub fn alternate_exchange(&self) -> Option<&str> {
        self.arguments.get(ALTERNATE_EXCHANGE).and_then(Value::as_str)
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Map<String, Value>,
}

impl QueueSpec {
    /// A durable, shared, non auto-deleting queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Map::new(),
        }
    }

    pub fn with_argument(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Exchange that rejected and expired messages are re-published to.
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments
            .get(DEAD_LETTER_EXCHANGE)
            .and_then(Value::as_str)
    }

    /// Time-to-live applied to every message in the queue.
    pub fn message_ttl(&self) -> Option<Duration> {
        self.arguments
            .get(MESSAGE_TTL)
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }
}

/// Queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Standing rule moving every message of `source_queue` onto
/// `destination_exchange`, keeping its routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingLink {
    pub name: String,
    pub source_queue: String,
    pub destination_exchange: String,
}

/// One step of a provisioning plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(BindingSpec),
    Link(ForwardingLink),
}

/// Names and declarations of one channel's retry pipeline.
///
/// Every stage name derives from the channel name, so the unrouted queue's
/// dead-letter target and the forwarding link's source always refer to the
/// same `<channel>.repub` stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTopology {
    channel: String,
    repub_interval: Duration,
}

impl ChannelTopology {
    pub fn new(channel: impl Into<String>, repub_interval: Duration) -> Self {
        Self {
            channel: channel.into(),
            repub_interval,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn repub_interval(&self) -> Duration {
        self.repub_interval
    }

    /// The topic exchange publishers and consumers use.
    pub fn primary_exchange(&self) -> &str {
        &self.channel
    }

    pub fn waiting(&self) -> String {
        waiting_exchange(&self.channel)
    }

    pub fn unrouted(&self) -> String {
        format!("{}{UNROUTED_SUFFIX}", self.channel)
    }

    pub fn repub(&self) -> String {
        format!("{}{REPUB_SUFFIX}", self.channel)
    }

    pub fn link_name(&self) -> String {
        format!("{}{LINK_SUFFIX}", self.repub())
    }

    pub fn forwarding_link(&self) -> ForwardingLink {
        ForwardingLink {
            name: self.link_name(),
            source_queue: self.repub(),
            destination_exchange: self.primary_exchange().to_owned(),
        }
    }

    /// Declarations in the order they must be applied.
    pub fn declarations(&self) -> Vec<Declaration> {
        let (waiting, unrouted, repub) = (self.waiting(), self.unrouted(), self.repub());
        let ttl = u64::try_from(self.repub_interval.as_millis()).unwrap_or(u64::MAX);

        vec![
            Declaration::Exchange(
                ExchangeSpec::durable(&unrouted, ExchangeKind::Fanout).internal(),
            ),
            Declaration::Exchange(ExchangeSpec::durable(&repub, ExchangeKind::Fanout).internal()),
            Declaration::Exchange(ExchangeSpec::durable(&waiting, ExchangeKind::Fanout)),
            Declaration::Exchange(
                ExchangeSpec::durable(self.primary_exchange(), ExchangeKind::Topic)
                    .with_argument(ALTERNATE_EXCHANGE, unrouted.as_str()),
            ),
            Declaration::Queue(
                QueueSpec::durable(&waiting)
                    .with_argument(DEAD_LETTER_EXCHANGE, self.primary_exchange()),
            ),
            Declaration::Binding(BindingSpec::new(&waiting, &waiting, "")),
            Declaration::Queue(
                QueueSpec::durable(&unrouted)
                    .with_argument(DEAD_LETTER_EXCHANGE, repub.as_str())
                    .with_argument(MESSAGE_TTL, ttl),
            ),
            Declaration::Binding(BindingSpec::new(&unrouted, &unrouted, "")),
            Declaration::Queue(QueueSpec::durable(&repub)),
            Declaration::Binding(BindingSpec::new(&repub, &repub, "")),
            Declaration::Link(self.forwarding_link()),
        ]
    }

    /// Exchanges in teardown order.
    pub fn exchanges(&self) -> [String; 4] {
        [
            self.waiting(),
            self.unrouted(),
            self.repub(),
            self.primary_exchange().to_owned(),
        ]
    }

    /// Queues in teardown order.
    pub fn queues(&self) -> [String; 3] {
        [self.waiting(), self.unrouted(), self.repub()]
    }
}

/// Exchange that delays retries of messages published on `channel`.
pub fn waiting_exchange(channel: &str) -> String {
    format!("{channel}{WAITING_SUFFIX}")
}

/// Trait for declaring and deleting broker entities.
///
/// Declarations must be idempotent: declaring an entity that exists with the
/// same settings succeeds, declaring it with different settings fails.
/// Deleting an entity that does not exist succeeds.
#[async_trait::async_trait]
pub trait DeclareTopology {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), Self::Error>;
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), Self::Error>;
    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), Self::Error>;
    async fn delete_exchange(&self, name: &str) -> Result<(), Self::Error>;
    async fn delete_queue(&self, name: &str) -> Result<(), Self::Error>;
}

/// Trait for managing forwarding links.
///
/// Creating an existing link with the same definition succeeds; deleting a
/// missing link succeeds.
#[async_trait::async_trait]
pub trait ForwardingLinks {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    async fn create_link(&self, link: &ForwardingLink) -> Result<(), Self::Error>;
    async fn delete_link(&self, name: &str) -> Result<(), Self::Error>;
    async fn link_exists(&self, name: &str) -> Result<bool, Self::Error>;
}

/// High-level façade over topology backends.
///
/// `Topology` provisions and tears down channels, delegating entity
/// declarations to `B` and forwarding links to `L`. The same value may serve
/// as both, e.g. the management API client or the in-memory broker.
pub struct Topology<B, L> {
    broker: B,
    links: L,
}

impl<B, L> Topology<B, L>
where
    B: DeclareTopology + Sync,
    L: ForwardingLinks + Sync,
{
    pub fn new(broker: B, links: L) -> Self {
        Self { broker, links }
    }

    /// Declare the full retry pipeline of `channel`.
    ///
    /// Calling this again with the same arguments leaves the topology as it
    /// is. Any failing declaration aborts provisioning.
    #[instrument(skip(self))]
    pub async fn provision_channel(
        &self,
        channel: &str,
        repub_interval: Duration,
    ) -> Result<ChannelTopology, TopologyError> {
        validate_channel(channel)?;
        let topology = ChannelTopology::new(channel, repub_interval);

        for declaration in topology.declarations() {
            self.apply(&declaration).await?;
        }

        tracing::info!(channel, "Channel provisioned");
        Ok(topology)
    }

    /// Declare a plain durable topic exchange with no retry wiring.
    #[instrument(skip(self))]
    pub async fn provision_simple_channel(&self, channel: &str) -> Result<(), TopologyError> {
        validate_channel(channel)?;
        self.apply(&Declaration::Exchange(ExchangeSpec::durable(
            channel,
            ExchangeKind::Topic,
        )))
        .await
    }

    /// Declare a durable consumer queue bound to the channel's exchange.
    #[instrument(skip(self))]
    pub async fn provision_subscription(
        &self,
        channel: &str,
        queue: &str,
        binding_key: &str,
    ) -> Result<(), TopologyError> {
        validate_channel(channel)?;
        if queue.trim().is_empty() {
            return Err(TopologyError::invalid_name(queue));
        }
        self.apply(&Declaration::Queue(QueueSpec::durable(queue)))
            .await?;
        self.apply(&Declaration::Binding(BindingSpec::new(
            channel,
            queue,
            binding_key,
        )))
        .await
    }

    /// Remove the forwarding link, then every exchange and queue of the
    /// channel.
    ///
    /// If the link is still present after deletion nothing else is touched:
    /// removing the exchanges under a live link would orphan it.
    #[instrument(skip(self))]
    pub async fn decommission_channel(&self, channel: &str) -> Result<(), TopologyError> {
        validate_channel(channel)?;
        let topology = ChannelTopology::new(channel, DEFAULT_REPUB_INTERVAL);
        let link = topology.link_name();

        self.links
            .delete_link(&link)
            .await
            .map_err(|e| TopologyError::link(e.into()))?;
        if self
            .links
            .link_exists(&link)
            .await
            .map_err(|e| TopologyError::link(e.into()))?
        {
            return Err(TopologyError::link_still_active(link));
        }

        for exchange in topology.exchanges() {
            self.broker
                .delete_exchange(&exchange)
                .await
                .map_err(|e| TopologyError::broker(e.into()))?;
        }
        for queue in topology.queues() {
            self.broker
                .delete_queue(&queue)
                .await
                .map_err(|e| TopologyError::broker(e.into()))?;
        }

        tracing::info!(channel, "Channel decommissioned");
        Ok(())
    }

    async fn apply(&self, declaration: &Declaration) -> Result<(), TopologyError> {
        tracing::debug!(?declaration, "Applying declaration");
        match declaration {
            Declaration::Exchange(exchange) => self
                .broker
                .declare_exchange(exchange)
                .await
                .map_err(|e| TopologyError::broker(e.into())),
            Declaration::Queue(queue) => self
                .broker
                .declare_queue(queue)
                .await
                .map_err(|e| TopologyError::broker(e.into())),
            Declaration::Binding(binding) => self
                .broker
                .bind_queue(binding)
                .await
                .map_err(|e| TopologyError::broker(e.into())),
            Declaration::Link(link) => self
                .links
                .create_link(link)
                .await
                .map_err(|e| TopologyError::link(e.into())),
        }
    }
}

fn validate_channel(channel: &str) -> Result<(), TopologyError> {
    if channel.trim().is_empty() {
        return Err(TopologyError::invalid_name(channel));
    }
    Ok(())
}

/// Error returned by topology operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct TopologyError {
    context: SpanTrace,
    kind: TopologyErrorKind,
}

/// Topology errors kind.
#[derive(Debug)]
pub enum TopologyErrorKind {
    /// Declaring or deleting an exchange, queue or binding failed.
    Broker(tower::BoxError),
    /// Creating, deleting or inspecting a forwarding link failed.
    Link(tower::BoxError),
    /// The forwarding link survived deletion.
    LinkStillActive(String),
    /// Blank channel or queue name.
    InvalidName(String),
}

impl TopologyError {
    fn broker(err: tower::BoxError) -> Self {
        Self::new(TopologyErrorKind::Broker(err))
    }

    fn link(err: tower::BoxError) -> Self {
        Self::new(TopologyErrorKind::Link(err))
    }

    fn link_still_active(name: String) -> Self {
        Self::new(TopologyErrorKind::LinkStillActive(name))
    }

    fn invalid_name(name: &str) -> Self {
        Self::new(TopologyErrorKind::InvalidName(name.to_owned()))
    }

    fn new(kind: TopologyErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &TopologyErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TopologyErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
            TopologyErrorKind::Link(err) => writeln!(f, "Forwarding link error: {err}"),
            TopologyErrorKind::LinkStillActive(name) => {
                writeln!(f, "Forwarding link {name} is still active")
            }
            TopologyErrorKind::InvalidName(name) => writeln!(f, "Invalid name: {name:?}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TopologyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TopologyErrorKind::Broker(err) | TopologyErrorKind::Link(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;

    fn in_memory_topology(broker: &InMemoryBroker) -> Topology<InMemoryBroker, InMemoryBroker> {
        Topology::new(broker.clone(), broker.clone())
    }

    #[test]
    fn stage_names_derive_from_the_channel() {
        let topology = ChannelTopology::new("jobs", DEFAULT_REPUB_INTERVAL);

        assert_eq!(topology.primary_exchange(), "jobs");
        assert_eq!(topology.waiting(), "jobs.waiting");
        assert_eq!(topology.unrouted(), "jobs.unrouted");
        assert_eq!(topology.repub(), "jobs.repub");
        assert_eq!(topology.link_name(), "jobs.repub.shovel");
    }

    #[test]
    fn link_source_and_unrouted_dead_letter_share_the_repub_stage() {
        let topology = ChannelTopology::new("jobs", Duration::from_millis(1500));
        let declarations = topology.declarations();

        let unrouted_dlx = declarations.iter().find_map(|d| match d {
            Declaration::Queue(q) if q.name == "jobs.unrouted" => {
                q.dead_letter_exchange().map(str::to_owned)
            }
            _ => None,
        });
        let link = declarations.iter().find_map(|d| match d {
            Declaration::Link(link) => Some(link.clone()),
            _ => None,
        });

        assert_eq!(unrouted_dlx.as_deref(), Some("jobs.repub"));
        assert_eq!(link.unwrap().source_queue, "jobs.repub");
    }

    #[test]
    fn declarations_follow_dependency_order() {
        let declarations = ChannelTopology::new("jobs", DEFAULT_REPUB_INTERVAL).declarations();
        let names: Vec<String> = declarations
            .iter()
            .map(|d| match d {
                Declaration::Exchange(e) => format!("exchange {}", e.name),
                Declaration::Queue(q) => format!("queue {}", q.name),
                Declaration::Binding(b) => format!("bind {}", b.queue),
                Declaration::Link(l) => format!("link {}", l.name),
            })
            .collect();

        assert_eq!(
            names,
            vec![
                "exchange jobs.unrouted",
                "exchange jobs.repub",
                "exchange jobs.waiting",
                "exchange jobs",
                "queue jobs.waiting",
                "bind jobs.waiting",
                "queue jobs.unrouted",
                "bind jobs.unrouted",
                "queue jobs.repub",
                "bind jobs.repub",
                "link jobs.repub.shovel",
            ]
        );
    }

    #[test]
    fn pipeline_entities_are_durable() {
        for declaration in ChannelTopology::new("jobs", DEFAULT_REPUB_INTERVAL).declarations() {
            match declaration {
                Declaration::Exchange(e) => assert!(e.durable && !e.auto_delete, "{}", e.name),
                Declaration::Queue(q) => assert!(q.durable && !q.auto_delete, "{}", q.name),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let broker = InMemoryBroker::default();
        let topology = in_memory_topology(&broker);

        topology
            .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
            .await
            .unwrap();
        let once = broker.snapshot().await;
        topology
            .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
            .await
            .unwrap();

        assert_eq!(broker.snapshot().await, once);
        assert_eq!(once.exchanges.len(), 4);
        assert_eq!(once.queues.len(), 3);
        assert_eq!(once.links.len(), 1);
    }

    #[tokio::test]
    async fn reprovisioning_with_other_arguments_fails() {
        let broker = InMemoryBroker::default();
        let topology = in_memory_topology(&broker);

        topology
            .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
            .await
            .unwrap();
        let err = topology
            .provision_channel("jobs", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), TopologyErrorKind::Broker(_)));
    }

    #[tokio::test]
    async fn decommission_removes_everything() {
        let broker = InMemoryBroker::default();
        let topology = in_memory_topology(&broker);

        topology
            .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
            .await
            .unwrap();
        topology.decommission_channel("jobs").await.unwrap();

        let snapshot = broker.snapshot().await;
        assert!(snapshot.exchanges.is_empty());
        assert!(snapshot.queues.is_empty());
        assert!(snapshot.bindings.is_empty());
        assert!(snapshot.links.is_empty());
    }

    #[tokio::test]
    async fn decommission_cleans_up_a_partial_provision() {
        let broker = InMemoryBroker::default();
        let topology = in_memory_topology(&broker);

        broker
            .declare_exchange(&ExchangeSpec::durable("jobs.waiting", ExchangeKind::Fanout))
            .await
            .unwrap();
        topology.decommission_channel("jobs").await.unwrap();

        assert!(broker.snapshot().await.exchanges.is_empty());
    }

    /// Link backend whose deletions never take effect.
    struct StickyLinks(InMemoryBroker);

    #[async_trait::async_trait]
    impl ForwardingLinks for StickyLinks {
        type Error = crate::inmemory::InMemoryBrokerError;

        async fn create_link(&self, link: &ForwardingLink) -> Result<(), Self::Error> {
            self.0.create_link(link).await
        }

        async fn delete_link(&self, _name: &str) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn link_exists(&self, name: &str) -> Result<bool, Self::Error> {
            self.0.link_exists(name).await
        }
    }

    #[tokio::test]
    async fn decommission_stops_when_the_link_survives() {
        let broker = InMemoryBroker::default();
        let topology = Topology::new(broker.clone(), StickyLinks(broker.clone()));

        topology
            .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
            .await
            .unwrap();
        let before = broker.snapshot().await;
        let err = topology.decommission_channel("jobs").await.unwrap_err();

        assert!(matches!(
            err.kind(),
            TopologyErrorKind::LinkStillActive(name) if name == "jobs.repub.shovel"
        ));
        assert_eq!(broker.snapshot().await, before);
    }

    #[tokio::test]
    async fn simple_channel_is_a_lone_topic_exchange() {
        let broker = InMemoryBroker::default();
        in_memory_topology(&broker)
            .provision_simple_channel("logging")
            .await
            .unwrap();

        let snapshot = broker.snapshot().await;
        assert_eq!(
            snapshot.exchanges.get("logging"),
            Some(&ExchangeSpec::durable("logging", ExchangeKind::Topic))
        );
        assert!(snapshot.queues.is_empty());
        assert!(snapshot.links.is_empty());
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let broker = InMemoryBroker::default();
        let topology = in_memory_topology(&broker);

        let err = topology
            .provision_channel(" ", DEFAULT_REPUB_INTERVAL)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), TopologyErrorKind::InvalidName(_)));

        let err = topology
            .provision_subscription("jobs", "", "email")
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), TopologyErrorKind::InvalidName(_)));
    }
}

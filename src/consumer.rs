//! Consumer loop dispatching broker deliveries to job handlers.
//!
//! This module implements a generic *consumer* that:
//!
//! - Subscribes to a queue with a prefetch of one
//! - Decodes and validates each delivery
//! - Dispatches it to the handler registered for its job
//! - Acknowledges, retries or rejects the delivery depending on the outcome
//! - Exposes lifecycle hooks for observability and customization
//!
//! ## Delivery outcomes
//!
//! | handler result                       | action                                       | [`Outcome`]  |
//! |--------------------------------------|----------------------------------------------|--------------|
//! | `Ok`                                 | ack                                          | `Acked`      |
//! | transient error, strategy allows     | republish to `<channel>.waiting`, then ack   | `Retried`    |
//! | terminal error or retries exhausted  | log, optionally escalate, reject             | `Failed`     |
//! | undecodable body or invalid metadata | reject                                       | `Rejected`   |
//!
//! Deliveries are never requeued: a requeued poisoned message would be
//! redelivered immediately, forever. Delayed redelivery goes through the
//! retry topology instead; see [`crate::topology`].
//!
//! The consumer runs until:
//! - The delivery stream ends (connection closed)
//! - A connectivity error occurs
//! - A [`CancellationToken`] is triggered

#[cfg(feature = "rabbitmq")]
pub mod amqp;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    Envelope, MalformedMessageError, Message, Metadata, ValidationError,
    job::{JobDefinition, JobRegistry},
    metadata::{CHANNEL, ERROR_MESSAGE, EXCHANGE, EXPIRATION, JOB, RETRIES, ROUTING_KEY},
    topology::waiting_exchange,
    transport::{DeliveryProperties, Transport, TransportError},
};

/// Number of unacknowledged deliveries the broker may push to one consumer.
pub const PREFETCH: u16 = 1;

/// Settlement of a single delivery.
///
/// Only acknowledgement and rejection without requeue are offered.
#[async_trait]
pub trait Acknowledge: Send {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Remove the delivery from its queue.
    async fn ack(self) -> Result<(), Self::Error>;

    /// Discard the delivery, or dead-letter it if its queue has a dead-letter
    /// exchange.
    async fn reject(self) -> Result<(), Self::Error>;
}

/// A message pushed by the broker, not yet settled.
#[derive(Debug)]
pub struct Delivery<A> {
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub acker: A,
}

/// Trait implemented by queue subscription backends.
#[async_trait]
pub trait Subscribe {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;
    type Acker: Acknowledge;

    /// Start consuming with at most `prefetch` unacknowledged deliveries.
    async fn subscribe(
        &self,
        prefetch: u16,
    ) -> Result<BoxStream<'static, Result<Delivery<Self::Acker>, Self::Error>>, Self::Error>;
}

/// Trait implemented by message handlers.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Handle one envelope. The job name is available under the `job`
    /// metadata key and is known to be registered.
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: Dispatch + ?Sized> Dispatch for Arc<T> {
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        (**self).dispatch(envelope).await
    }
}

/// Error returned by a handler.
///
/// Transient errors go through the job's retry strategy; terminal errors fail
/// the job straight away.
#[derive(Debug)]
pub struct HandlerError {
    context: SpanTrace,
    kind: HandlerErrorKind,
}

#[derive(Debug)]
pub enum HandlerErrorKind {
    Transient(tower::BoxError),
    Terminal(tower::BoxError),
}

impl HandlerError {
    pub fn transient(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HandlerErrorKind::Transient(err.into()),
        }
    }

    pub fn terminal(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HandlerErrorKind::Terminal(err.into()),
        }
    }

    pub fn kind(&self) -> &HandlerErrorKind {
        &self.kind
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, HandlerErrorKind::Terminal(_))
    }

    /// The error the handler reported, without tracing context.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match &self.kind {
            HandlerErrorKind::Transient(err) | HandlerErrorKind::Terminal(err) => err.as_ref(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HandlerErrorKind::Transient(err) => writeln!(f, "Transient handler error: {err}"),
            HandlerErrorKind::Terminal(err) => writeln!(f, "Terminal handler error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause())
    }
}

/// Where failed jobs are reported.
///
/// A `JobFailed` message carrying the failed envelope under `failed_message`
/// is published here before the delivery is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRoute {
    pub exchange: String,
    pub routing_key: String,
}

impl FailureRoute {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded.
    Acked,
    /// A retry was scheduled on the waiting stage.
    Retried,
    /// The job failed for good.
    Failed,
    /// The delivery could not be decoded or validated.
    Rejected,
}

/// Queue consumer.
///
/// Generic parameters:
/// - `D`: Handler invoked for every valid delivery
/// - `R`: Subscription backend the deliveries come from
/// - `J`: Registry of known jobs and their retry strategies
/// - `T`: Transport service used to republish retries and failure reports
/// - `HK`: Hook implementation for lifecycle events
///
/// Deliveries are processed one at a time. Run several consumers on separate
/// subscriptions for parallelism. The transport should publish on a different
/// AMQP channel than the one the subscription consumes from.
pub struct Consumer<D, R, J, T, HK> {
    dispatcher: D,
    subscription: R,
    jobs: J,
    transport: Transport<T>,
    failure_route: Option<FailureRoute>,
    hook: HK,
}

impl<D, R, J, T> Consumer<D, R, J, T, DefaultConsumerHook>
where
    D: Dispatch,
    R: Subscribe,
    J: JobRegistry,
{
    /// Create a new consumer with the default hook implementation.
    pub fn new(dispatcher: D, subscription: R, jobs: J, transport: Transport<T>) -> Self {
        Self {
            dispatcher,
            subscription,
            jobs,
            transport,
            failure_route: None,
            hook: DefaultConsumerHook,
        }
    }
}

impl<D, R, J, T, HK> Consumer<D, R, J, T, HK>
where
    D: Dispatch,
    R: Subscribe,
    J: JobRegistry,
    HK: ConsumerHook,
    T: Service<Envelope> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    /// Replace the consumer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<D, R, J, T, HK2> {
        Consumer {
            dispatcher: self.dispatcher,
            subscription: self.subscription,
            jobs: self.jobs,
            transport: self.transport,
            failure_route: self.failure_route,
            hook,
        }
    }

    /// Report failed jobs to `route`.
    pub fn with_failure_route(mut self, route: FailureRoute) -> Self {
        self.failure_route = Some(route);
        self
    }

    /// Run the consumer loop.
    ///
    /// A delivery being processed when `cancel` fires is settled before the
    /// loop returns.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumerRunError> {
        self.hook.on_startup();

        let mut deliveries = self
            .subscription
            .subscribe(PREFETCH)
            .await
            .map_err(|e| ConsumerRunError::connectivity(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return Ok(());
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.process(delivery).await?;
                        }
                        Some(Err(err)) => {
                            let err = err.into();
                            self.hook.on_delivery_error(err.as_ref());
                            return Err(ConsumerRunError::connectivity(err));
                        }
                        None => {
                            self.hook.on_stream_end();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Process and settle a single delivery.
    ///
    /// Errors are connectivity failures: the delivery may be left unsettled,
    /// in which case the broker redelivers it once the channel closes.
    #[tracing::instrument(skip_all, fields(redelivered = delivery.redelivered))]
    pub async fn process(
        &self,
        delivery: Delivery<R::Acker>,
    ) -> Result<Outcome, ConsumerRunError> {
        let Delivery { body, acker, .. } = delivery;

        let envelope = match Envelope::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.hook.on_malformed_message(&err);
                reject(acker).await?;
                return Ok(Outcome::Rejected);
            }
        };

        let definition = match self.job_definition(&envelope) {
            Ok(definition) => definition,
            Err(err) => {
                self.hook.on_invalid_message(&envelope, &err);
                reject(acker).await?;
                return Ok(Outcome::Rejected);
            }
        };

        self.hook.on_dispatch(&envelope);
        let error = match self.dispatcher.dispatch(&envelope).await {
            Ok(()) => {
                ack(acker).await?;
                self.hook.on_job_completed(&envelope);
                return Ok(Outcome::Acked);
            }
            Err(error) => error,
        };

        let strategy = definition.strategy();
        if !error.is_terminal() && strategy.can_retry(&envelope) {
            let delay = strategy.retry_interval(&envelope);
            match retry_envelope(&envelope, delay) {
                Ok(retry) => {
                    self.publish(retry.clone()).await?;
                    ack(acker).await?;
                    self.hook.on_job_retried(&retry, delay, &error);
                    return Ok(Outcome::Retried);
                }
                Err(err) => self.hook.on_invalid_message(&envelope, &err),
            }
        }

        self.hook.on_job_failed(&envelope, &error);
        if let Some(route) = &self.failure_route {
            self.publish(failure_report(&envelope, &error, route)?)
                .await?;
        }
        reject(acker).await?;
        Ok(Outcome::Failed)
    }

    fn job_definition(&self, envelope: &Envelope) -> Result<&JobDefinition, ValidationError> {
        let job = envelope.metadata.job()?;
        self.jobs
            .get(job)
            .ok_or_else(|| ValidationError::unregistered(JOB, job))
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), ConsumerRunError> {
        let mut transport = self.transport.clone();
        transport.send(envelope).await.map_err(|e| {
            self.hook.on_publish_error(&e);
            ConsumerRunError::transport(e)
        })
    }
}

async fn ack<A: Acknowledge>(acker: A) -> Result<(), ConsumerRunError> {
    acker
        .ack()
        .await
        .map_err(|e| ConsumerRunError::connectivity(e.into()))
}

async fn reject<A: Acknowledge>(acker: A) -> Result<(), ConsumerRunError> {
    acker
        .reject()
        .await
        .map_err(|e| ConsumerRunError::connectivity(e.into()))
}

/// Build the envelope that schedules another attempt of `envelope` after
/// `delay`.
///
/// The retry counter is incremented and the channel pinned under `_channel`,
/// falling back to the `exchange` the message was published to. The message
/// goes to the channel's waiting stage with the same routing key and headers.
/// Metadata the transport could not publish fails here, so the delivery is
/// rejected instead of stalling the loop on a failed republish.
pub fn retry_envelope(envelope: &Envelope, delay: Duration) -> Result<Envelope, ValidationError> {
    let metadata = &envelope.metadata;
    let channel = match metadata.channel()? {
        Some(channel) => channel,
        None => metadata.exchange()?,
    };
    let retries = metadata.retries()?.saturating_add(1);
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

    let retry = envelope.with_metadata(
        metadata
            .with(RETRIES, retries)
            .with(CHANNEL, channel)
            .with(EXPIRATION, delay_ms)
            .with(EXCHANGE, waiting_exchange(channel)),
    );
    DeliveryProperties::from_metadata(&retry.metadata)?;
    Ok(retry)
}

fn failure_report(
    envelope: &Envelope,
    error: &HandlerError,
    route: &FailureRoute,
) -> Result<Envelope, ConsumerRunError> {
    let reason = error.cause().to_string();
    let failed = envelope.with_metadata(envelope.metadata.with(ERROR_MESSAGE, reason.as_str()));
    let failed = serde_json::to_value(&failed)
        .map_err(|e| ConsumerRunError::transport(TransportError::serde(Box::new(e))))?;

    Ok(Envelope::new(
        Message::new("JobFailed").with_field("failed_message", failed),
        Metadata::new()
            .with(EXCHANGE, route.exchange.as_str())
            .with(ROUTING_KEY, route.routing_key.as_str())
            .with(ERROR_MESSAGE, reason),
    ))
}

/// Error returned when the consumer loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: SpanTrace,
    kind: ConsumerRunErrorKind,
}

impl ConsumerRunError {
    fn connectivity(error: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Connectivity(error),
        }
    }

    fn transport(error: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Transport(error),
        }
    }

    pub fn kind(&self) -> &ConsumerRunErrorKind {
        &self.kind
    }
}

/// Classification of consumer runtime errors.
#[derive(Debug)]
pub enum ConsumerRunErrorKind {
    /// Subscribing, receiving or settling a delivery failed.
    Connectivity(tower::BoxError),
    /// Republishing a retry or failure report failed.
    Transport(TransportError),
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerRunErrorKind::Connectivity(err) => writeln!(f, "Connectivity error: {err}"),
            ConsumerRunErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerRunErrorKind::Connectivity(err) => Some(err.as_ref()),
            ConsumerRunErrorKind::Transport(err) => Some(err),
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_dispatch(&self, envelope: &Envelope);
    fn on_job_completed(&self, envelope: &Envelope);
    fn on_job_retried(&self, retry: &Envelope, delay: Duration, error: &HandlerError);
    fn on_job_failed(&self, envelope: &Envelope, error: &HandlerError);
    fn on_malformed_message(&self, error: &MalformedMessageError);
    fn on_invalid_message(&self, envelope: &Envelope, error: &ValidationError);
    fn on_publish_error(&self, error: &TransportError);
    fn on_delivery_error(&self, error: &dyn std::error::Error);
    fn on_stream_end(&self);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_dispatch(&self, envelope: &Envelope) {
        tracing::debug!(job = ?envelope.metadata.get(JOB), "Dispatching message");
    }

    fn on_job_completed(&self, envelope: &Envelope) {
        tracing::debug!(job = ?envelope.metadata.get(JOB), "Job completed");
    }

    fn on_job_retried(&self, retry: &Envelope, delay: Duration, error: &HandlerError) {
        tracing::warn!(
            job = ?retry.metadata.get(JOB),
            retries = ?retry.metadata.get(RETRIES),
            ?delay,
            error = %error.cause(),
            "Job failed, retry scheduled"
        );
    }

    fn on_job_failed(&self, envelope: &Envelope, error: &HandlerError) {
        tracing::error!(
            job = ?envelope.metadata.get(JOB),
            error = %error.cause(),
            metadata = ?envelope.metadata,
            "Job failed"
        );
    }

    fn on_malformed_message(&self, error: &MalformedMessageError) {
        tracing::error!(?error, "Malformed message rejected");
    }

    fn on_invalid_message(&self, envelope: &Envelope, error: &ValidationError) {
        tracing::error!(%error, metadata = ?envelope.metadata, "Invalid message");
    }

    fn on_publish_error(&self, error: &TransportError) {
        tracing::error!(?error, "Error publishing message");
    }

    fn on_delivery_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error receiving delivery");
    }

    fn on_stream_end(&self) {
        tracing::info!("Delivery stream ended");
    }
}

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use postroute::{
    Consumer, ConsumerHook, ConsumerRunErrorKind, Dispatch, Envelope, FailureRoute, HandlerError,
    InMemoryBroker, MalformedMessageError, Message, Metadata, Topology, TransportError,
    ValidationError,
    job::{FixedRetry, JobDefinition, JobMap},
    topology::DEFAULT_REPUB_INTERVAL,
    transport::{Transport, layers::JsonLayer},
};
use serde_json::json;
use tokio::time::advance;
use tokio_util::sync::CancellationToken;

/// Handler recording every attempt and answering with a fixed result.
#[derive(Clone)]
struct Recorder {
    attempts: Arc<Mutex<Vec<Metadata>>>,
    outcome: fn() -> Result<(), HandlerError>,
}

impl Recorder {
    fn new(outcome: fn() -> Result<(), HandlerError>) -> Self {
        Self {
            attempts: Arc::default(),
            outcome,
        }
    }

    fn attempts(&self) -> Vec<Metadata> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Dispatch for Recorder {
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self.attempts.lock().unwrap().push(envelope.metadata.clone());
        (self.outcome)()
    }
}

fn succeed() -> Result<(), HandlerError> {
    Ok(())
}

fn smtp_down() -> Result<(), HandlerError> {
    Err(HandlerError::transient("smtp unavailable"))
}

fn bad_address() -> Result<(), HandlerError> {
    Err(HandlerError::terminal("mailbox does not exist"))
}

/// Hook keeping the job key of every failed job.
#[derive(Clone, Default)]
struct FailureLog {
    jobs: Arc<Mutex<Vec<String>>>,
}

impl FailureLog {
    fn jobs(&self) -> Vec<String> {
        self.jobs.lock().unwrap().clone()
    }
}

impl ConsumerHook for FailureLog {
    fn on_startup(&self) {}
    fn on_shutdown(&self) {}
    fn on_dispatch(&self, _envelope: &Envelope) {}
    fn on_job_completed(&self, _envelope: &Envelope) {}
    fn on_job_retried(&self, _retry: &Envelope, _delay: Duration, _error: &HandlerError) {}

    fn on_job_failed(&self, envelope: &Envelope, _error: &HandlerError) {
        let job = envelope.metadata.job().unwrap_or_default().to_owned();
        self.jobs.lock().unwrap().push(job);
    }

    fn on_malformed_message(&self, _error: &MalformedMessageError) {}
    fn on_invalid_message(&self, _envelope: &Envelope, _error: &ValidationError) {}
    fn on_publish_error(&self, _error: &TransportError) {}
    fn on_delivery_error(&self, _error: &dyn std::error::Error) {}
    fn on_stream_end(&self) {}
}

async fn provision(broker: &InMemoryBroker) {
    let topology = Topology::new(broker.clone(), broker.clone());
    topology
        .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
        .await
        .unwrap();
    topology
        .provision_subscription("jobs", "email", "email")
        .await
        .unwrap();
    topology.provision_simple_channel("logging").await.unwrap();
    topology
        .provision_subscription("logging", "failures", "#")
        .await
        .unwrap();
}

fn send_email() -> Envelope {
    Envelope::new(
        Message::new("SendEmail").with_field("to", "someone@example.com"),
        Metadata::new()
            .with("job", "email.send")
            .with("exchange", "jobs")
            .with("routing_key", "email"),
    )
}

async fn publish(broker: &InMemoryBroker, envelope: Envelope) {
    Transport::new(broker.clone())
        .layer(JsonLayer)
        .send(envelope)
        .await
        .unwrap();
}

fn jobs(limit: u32, interval: Duration) -> JobMap {
    JobMap::new().with_job(
        "email.send",
        JobDefinition::new(FixedRetry::new(limit, interval)),
    )
}

/// Consume the `email` queue until it is empty.
async fn drain(broker: &InMemoryBroker, handler: &Recorder, jobs: &JobMap, log: &FailureLog) {
    Consumer::new(
        handler.clone(),
        broker.subscription("email"),
        jobs.clone(),
        Transport::new(broker.clone()).layer(JsonLayer),
    )
    .with_hook(log.clone())
    .with_failure_route(FailureRoute::new("logging", "job.failed"))
    .run(CancellationToken::new())
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn unrouted_message_returns_once_a_consumer_binds() {
    let broker = InMemoryBroker::default();
    let topology = Topology::new(broker.clone(), broker.clone());
    topology
        .provision_channel("jobs", DEFAULT_REPUB_INTERVAL)
        .await
        .unwrap();

    publish(&broker, send_email()).await;
    assert_eq!(broker.queue_depth("jobs.unrouted").await, 1);

    topology
        .provision_subscription("jobs", "email", "email")
        .await
        .unwrap();
    advance(DEFAULT_REPUB_INTERVAL - Duration::from_millis(1)).await;
    assert_eq!(broker.queue_depth("email").await, 0);

    advance(Duration::from_millis(1)).await;
    assert_eq!(broker.queue_depth("jobs.unrouted").await, 0);
    assert_eq!(broker.queue_depth("jobs.repub").await, 0);
    assert_eq!(broker.peek("email").await, vec![send_email()]);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_two_retries_then_fail() {
    let broker = InMemoryBroker::default();
    provision(&broker).await;
    let handler = Recorder::new(smtp_down);
    let log = FailureLog::default();
    let jobs = jobs(2, Duration::from_millis(1000));

    publish(&broker, send_email()).await;
    drain(&broker, &handler, &jobs, &log).await;

    let waiting = broker.peek("jobs.waiting").await;
    assert_eq!(waiting.len(), 1);
    let retry = &waiting[0].metadata;
    assert_eq!(retry.retries().unwrap(), 1);
    assert_eq!(retry.get("_channel"), Some(&json!("jobs")));
    assert_eq!(retry.get("exchange"), Some(&json!("jobs.waiting")));
    assert_eq!(retry.get("routing_key"), Some(&json!("email")));
    assert_eq!(retry.expiration().unwrap(), Some(Duration::from_millis(1000)));

    advance(Duration::from_millis(1000)).await;
    drain(&broker, &handler, &jobs, &log).await;
    advance(Duration::from_millis(1000)).await;
    drain(&broker, &handler, &jobs, &log).await;

    let retries: Vec<u32> = handler
        .attempts()
        .iter()
        .map(|m| m.retries().unwrap())
        .collect();
    assert_eq!(retries, vec![0, 1, 2]);
    assert_eq!(log.jobs(), vec!["email.send".to_owned()]);
    assert_eq!(broker.queue_depth("email").await, 0);
    assert_eq!(broker.queue_depth("jobs.waiting").await, 0);
    assert_eq!(broker.unacked().await, 0);

    let reports = broker.peek("failures").await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].message.kind(), "JobFailed");
    assert_eq!(
        reports[0].metadata.get("_error_message"),
        Some(&json!("smtp unavailable"))
    );
    assert_eq!(
        reports[0].message.payload()["failed_message"]["metadata"]["job"],
        "email.send"
    );
}

#[tokio::test(start_paused = true)]
async fn fourth_attempt_observes_three_retries_and_fails() {
    let broker = InMemoryBroker::default();
    provision(&broker).await;
    let handler = Recorder::new(smtp_down);
    let log = FailureLog::default();
    let jobs = jobs(3, Duration::from_millis(500));

    publish(&broker, send_email()).await;
    for _ in 0..4 {
        drain(&broker, &handler, &jobs, &log).await;
        advance(Duration::from_millis(500)).await;
    }

    let attempts = handler.attempts();
    assert_eq!(attempts.len(), 4);
    assert_eq!(attempts[3].retries().unwrap(), 3);
    assert_eq!(log.jobs().len(), 1);
    assert_eq!(broker.queue_depth("jobs.waiting").await, 0);
    assert_eq!(broker.queue_depth("email").await, 0);
}

#[tokio::test(start_paused = true)]
async fn waiting_message_is_held_for_its_expiration() {
    let broker = InMemoryBroker::default();
    provision(&broker).await;

    let envelope = send_email();
    let delayed = envelope.with_metadata(
        envelope
            .metadata
            .with("exchange", "jobs.waiting")
            .with("expiration", 5000),
    );
    publish(&broker, delayed).await;

    advance(Duration::from_millis(4999)).await;
    assert_eq!(broker.queue_depth("email").await, 0);
    assert_eq!(broker.queue_depth("jobs.waiting").await, 1);

    advance(Duration::from_millis(1)).await;
    assert_eq!(broker.queue_depth("email").await, 1);
}

#[tokio::test]
async fn successful_jobs_are_acked_with_prefetch_one() {
    let broker = InMemoryBroker::default();
    provision(&broker).await;
    let handler = Recorder::new(succeed);
    let log = FailureLog::default();

    publish(&broker, send_email()).await;
    drain(&broker, &handler, &jobs(3, Duration::ZERO), &log).await;

    assert_eq!(handler.attempts().len(), 1);
    assert_eq!(broker.prefetch().await, Some(postroute::consumer::PREFETCH));
    assert_eq!(postroute::consumer::PREFETCH, 1);
    assert_eq!(broker.queue_depth("email").await, 0);
    assert_eq!(broker.unacked().await, 0);
    assert!(log.jobs().is_empty());
}

#[tokio::test]
async fn terminal_errors_skip_the_retry_strategy() {
    let broker = InMemoryBroker::default();
    provision(&broker).await;
    let handler = Recorder::new(bad_address);
    let log = FailureLog::default();

    publish(&broker, send_email()).await;
    drain(&broker, &handler, &jobs(5, Duration::ZERO), &log).await;

    assert_eq!(handler.attempts().len(), 1);
    assert_eq!(log.jobs(), vec!["email.send".to_owned()]);
    assert_eq!(broker.queue_depth("jobs.waiting").await, 0);
    assert_eq!(broker.queue_depth("failures").await, 1);
}

#[tokio::test]
async fn poisoned_messages_are_rejected_without_dispatch() {
    let broker = InMemoryBroker::default();
    provision(&broker).await;
    let handler = Recorder::new(succeed);
    let log = FailureLog::default();

    broker
        .publish_raw("jobs", "email", "not json")
        .await
        .unwrap();
    let envelope = send_email();
    publish(
        &broker,
        envelope.with_metadata(envelope.metadata.with("job", "email.unknown")),
    )
    .await;
    publish(
        &broker,
        envelope.with_metadata(envelope.metadata.without("job")),
    )
    .await;

    drain(&broker, &handler, &jobs(3, Duration::ZERO), &log).await;

    assert!(handler.attempts().is_empty());
    assert_eq!(broker.queue_depth("email").await, 0);
    assert_eq!(broker.queue_depth("jobs.waiting").await, 0);
    assert_eq!(broker.unacked().await, 0);
}

#[tokio::test]
async fn unpublishable_retry_fails_the_job_instead_of_stalling() {
    let broker = InMemoryBroker::default();
    provision(&broker).await;
    let handler = Recorder::new(smtp_down);
    let log = FailureLog::default();

    let body = json!({
        "message": {"type": "SendEmail"},
        "metadata": {"job": "email.send", "exchange": "jobs", "routing_key": 5},
    });
    broker
        .publish_raw("jobs", "email", body.to_string())
        .await
        .unwrap();

    drain(&broker, &handler, &jobs(3, Duration::ZERO), &log).await;

    assert_eq!(handler.attempts().len(), 1);
    assert_eq!(log.jobs(), vec!["email.send".to_owned()]);
    assert_eq!(broker.unacked().await, 0);
    assert_eq!(broker.queue_depth("email").await, 0);
    assert_eq!(broker.queue_depth("jobs.waiting").await, 0);
    assert_eq!(broker.queue_depth("failures").await, 1);
}

#[tokio::test]
async fn missing_queue_is_a_connectivity_error() {
    let broker = InMemoryBroker::default();

    let err = Consumer::new(
        Recorder::new(succeed),
        broker.subscription("email"),
        jobs(3, Duration::ZERO),
        Transport::new(broker.clone()).layer(JsonLayer),
    )
    .run(CancellationToken::new())
    .await
    .unwrap_err();

    assert!(matches!(err.kind(), ConsumerRunErrorKind::Connectivity(_)));
}

use std::time::Duration;

use lapin::{Connection, ConnectionProperties, options::ConfirmSelectOptions};
use postroute::config::Config;
use postroute::consumer::amqp::AmqpSubscription;
use postroute::job::{ExponentialBackoff, FixedRetry, JobDefinition, JobMap};
use postroute::topology::{amqp::AmqpTopology, management::ManagementClient};
use postroute::transport::{layers::JsonLayer, rabbitmq::RabbitMq};
use postroute::{
    Consumer, Dispatch, Envelope, FailureRoute, HandlerError, Message, Metadata, Topology,
    Transport,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

struct Handler;

#[async_trait::async_trait]
impl Dispatch for Handler {
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let retries = envelope.metadata.retries().map_err(HandlerError::terminal)?;
        match envelope.message.payload().get("fail_times").and_then(|v| v.as_u64()) {
            Some(times) if u64::from(retries) < times => {
                Err(HandlerError::transient(format!("attempt {} failed", retries + 1)))
            }
            _ => {
                tracing::info!(kind = envelope.message.kind(), retries, "Handled");
                Ok(())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = Config::from_env().unwrap();
    let connection = Connection::connect(&config.amqp_uri, ConnectionProperties::default())
        .await
        .unwrap();

    // Declarations, consumption and publishing each get their own channel.
    let topology = Topology::new(
        AmqpTopology::new(connection.create_channel().await.unwrap()),
        ManagementClient::from_config(&config),
    );
    topology
        .provision_channel("jobs", config.repub_interval())
        .await
        .unwrap();
    topology
        .provision_subscription("jobs", "email", "email")
        .await
        .unwrap();
    topology.provision_simple_channel("logging").await.unwrap();

    let publisher = connection.create_channel().await.unwrap();
    publisher
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .unwrap();
    let mut transport = Transport::new(RabbitMq::new(publisher)).layer(JsonLayer);

    transport
        .send(Envelope::new(
            Message::new("SendEmail")
                .with_field("to", "someone@example.com")
                .with_field("fail_times", 2),
            Metadata::new()
                .with("exchange", "jobs")
                .with("routing_key", "email")
                .with("job", "email.send"),
        ))
        .await
        .unwrap();

    let jobs = JobMap::new()
        .with_job(
            "email.send",
            JobDefinition::new(ExponentialBackoff::new(3, Duration::from_secs(1))),
        )
        .with_job(
            "email.digest",
            JobDefinition::new(FixedRetry::new(5, Duration::from_secs(60))),
        );

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let subscription = AmqpSubscription::new(connection.create_channel().await.unwrap(), "email");
    Consumer::new(Handler, subscription, jobs, transport)
        .with_failure_route(FailureRoute::new("logging", "job.failed"))
        .run(cancel)
        .await
        .unwrap();
}

use async_trait::async_trait;
use lapin::{
    options::{
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
};

use crate::{
    topology::{BindingSpec, DeclareTopology, ExchangeKind, ExchangeSpec, QueueSpec},
    transport::rabbitmq::field_table,
};

/// Declares exchanges, queues and bindings over an AMQP channel.
///
/// AMQP has no notion of shovels, so pair this with a [`ForwardingLinks`]
/// backend such as [`ManagementClient`] in a [`Topology`].
///
/// A declaration the broker refuses closes the channel (`PRECONDITION_FAILED`);
/// create a fresh channel before retrying.
///
/// [`ForwardingLinks`]: crate::topology::ForwardingLinks
/// [`ManagementClient`]: crate::topology::management::ManagementClient
/// [`Topology`]: crate::topology::Topology
#[derive(Clone)]
pub struct AmqpTopology {
    channel: lapin::Channel,
}

impl AmqpTopology {
    pub fn new(channel: lapin::Channel) -> Self {
        Self { channel }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

#[async_trait]
impl DeclareTopology for AmqpTopology {
    type Error = lapin::Error;

    #[tracing::instrument(skip_all, fields(exchange = %exchange.name))]
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), Self::Error> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.into(),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    ..Default::default()
                },
                field_table(&exchange.arguments),
            )
            .await
    }

    #[tracing::instrument(skip_all, fields(queue = %queue.name))]
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), Self::Error> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                field_table(&queue.arguments),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), Self::Error> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
    }

    // RabbitMQ treats deletes of missing entities as success.
    async fn delete_exchange(&self, name: &str) -> Result<(), Self::Error> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Self::Error> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }
}

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions},
    types::FieldTable,
};
use tokio_stream::StreamExt as _;

use crate::consumer::{Acknowledge, Delivery, Subscribe};

/// Queue subscription over an AMQP channel.
///
/// Deliveries require manual acknowledgement. Closing the channel or the
/// connection ends the delivery stream and returns every unsettled delivery
/// to its queue.
#[derive(Clone)]
pub struct AmqpSubscription {
    channel: lapin::Channel,
    queue: String,
    consumer_tag: String,
}

impl AmqpSubscription {
    /// Subscribe to `queue`; the broker picks the consumer tag.
    pub fn new(channel: lapin::Channel, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
            consumer_tag: String::new(),
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }
}

#[async_trait]
impl Subscribe for AmqpSubscription {
    type Error = lapin::Error;
    type Acker = AmqpAcker;

    #[tracing::instrument(skip(self), fields(queue = %self.queue))]
    async fn subscribe(
        &self,
        prefetch: u16,
    ) -> Result<BoxStream<'static, Result<Delivery<AmqpAcker>, lapin::Error>>, lapin::Error> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(tag = consumer.tag().as_str(), "Subscribed");
        Ok(Box::pin(consumer.map(|delivery| {
            delivery.map(|delivery| Delivery {
                body: delivery.data,
                redelivered: delivery.redelivered,
                acker: AmqpAcker(delivery.acker),
            })
        })))
    }
}

/// Settles one AMQP delivery.
pub struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    type Error = lapin::Error;

    async fn ack(self) -> Result<(), Self::Error> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(self) -> Result<(), Self::Error> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AmqpAcker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpAcker").finish_non_exhaustive()
    }
}

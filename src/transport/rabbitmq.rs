use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties,
    options::BasicPublishOptions,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{
    Envelope,
    transport::{DeliveryProperties, Sender, ToBytes},
};

/// Persistent delivery mode (AMQP `delivery-mode = 2`).
const PERSISTENT: u8 = 2;

/// RabbitMQ transport sender.
///
/// This sender publishes messages using a shared `lapin::Channel`.
///
/// ## Design
///
/// - Exchange and routing key come from the envelope metadata
/// - Every message is published as **persistent**
/// - The `headers` metadata map becomes the **AMQP message headers**
/// - The `expiration` metadata value becomes the **AMQP expiration**
/// - The payload is published as-is, so put a
///   [`JsonLayer`](crate::transport::layers::JsonLayer) in front of it
///
/// Give the sender its own channel. Publishing on the channel a consumer is
/// reading from can stall acknowledgements behind publisher confirms.
///
/// The channel is wrapped in `Arc<Mutex<_>>` because:
/// - `Sender::send` is async and may be called concurrently
/// - confirms must be awaited in publish order
pub struct RabbitMq {
    channel: Arc<Mutex<lapin::Channel>>,
}

impl RabbitMq {
    /// Create a sender publishing on `channel`.
    ///
    /// Publisher confirms are awaited on every send; enable them on the channel
    /// with `confirm_select` to get broker acknowledgements.
    pub fn new(channel: lapin::Channel) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }
}

impl Clone for RabbitMq {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

#[async_trait]
impl<M> Sender<M> for RabbitMq
where
    M: ToBytes + Send + Sync + 'static,
{
    type Error = tower::BoxError;

    /// Publish a message to RabbitMQ.
    ///
    /// The call waits for both:
    /// - the publish to be sent
    /// - the broker confirmation (publisher confirms)
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<M>) -> Result<(), Self::Error> {
        let delivery = DeliveryProperties::from_metadata(&envelope.metadata)?;
        let properties = basic_properties(&delivery);

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &delivery.exchange,
                &delivery.routing_key,
                BasicPublishOptions::default(),
                envelope.message.to_bytes(),
                properties,
            )
            .await?
            .await?;

        tracing::debug!(
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            "Message published"
        );
        Ok(())
    }
}

fn basic_properties(delivery: &DeliveryProperties) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(ShortString::from("application/json"));

    if let Some(headers) = &delivery.headers {
        properties = properties.with_headers(field_table(headers));
    }
    if let Some(expiration) = delivery.expiration {
        properties =
            properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }
    properties
}

/// Convert a JSON map into an AMQP field table.
pub(crate) fn field_table(map: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(field_table(map)),
    }
}

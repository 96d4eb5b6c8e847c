use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    Envelope,
    transport::{DeliveryProperties, Sender},
};

/// Recording transport for testing or local pipelines.
///
/// This sender validates the delivery properties like a real backend would,
/// then stores the envelope in a shared list instead of publishing it. It is
/// useful for:
/// - Unit testing consumer behaviour without a broker
/// - Asserting on exactly what would have been published
///
/// ## Type Parameters
///
/// - `M`: type of the message payload
pub struct InMemory<M> {
    /// Shared list of sent envelopes.
    sent: Arc<Mutex<Vec<Envelope<M>>>>,
}

impl<M> InMemory<M> {
    /// Return all envelopes that have been "sent" and clear the internal list.
    pub async fn take_sent(&self) -> Vec<Envelope<M>> {
        let mut sent = self.sent.lock().await;
        std::mem::take(&mut *sent)
    }
}

impl<M> Clone for InMemory<M> {
    fn clone(&self) -> Self {
        Self {
            sent: Arc::clone(&self.sent),
        }
    }
}

impl<M> Default for InMemory<M> {
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl<M> Sender<M> for InMemory<M>
where
    M: std::fmt::Debug + Send,
{
    type Error = tower::BoxError;

    /// "Send" an envelope by appending it to the in-memory list.
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<M>) -> Result<(), Self::Error> {
        let properties = DeliveryProperties::from_metadata(&envelope.metadata)?;
        tracing::info!(
            exchange = %properties.exchange,
            routing_key = %properties.routing_key,
            msg = ?envelope.message,
            "Message recorded by in-memory transport",
        );
        self.sent.lock().await.push(envelope);
        Ok(())
    }
}

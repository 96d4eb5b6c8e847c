use crate::{Envelope, transport::RawPayload};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that encodes envelopes to their JSON wire form.
///
/// The whole envelope (`{ "message": ..., "metadata": ... }`) is serialized
/// into a [`RawPayload`]. The metadata is kept alongside the bytes so the
/// backend can still derive exchange, routing key and delivery properties
/// from it.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Envelope<M>> for JsonService<T>
where
    M: serde::Serialize + Send + 'static,
    T: Service<Envelope<RawPayload>> + Clone + Send + 'static,
    <T as Service<Envelope<RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<M>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bytes = serde_json::to_vec(&req)?;
            let envelope = Envelope {
                message: RawPayload(bytes),
                metadata: req.metadata,
            };

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
///
/// Wraps an existing service so that all outgoing envelopes are encoded to
/// JSON before they reach the backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

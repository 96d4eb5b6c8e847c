//! Transport abstractions and sender backends.
//!
//! This module defines a Tower-compatible transport layer used to publish
//! [`Envelope`]s to a broker (RabbitMQ, the in-process broker, or a recording
//! sender for tests).
//!
//! The transport is built around Tower's `Service` abstraction, enabling
//! middleware composition (encoding, tracing, buffering, etc.) while keeping
//! sender implementations backend-agnostic.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete sender backends
//! - [`DeliveryProperties`]: Broker properties derived from envelope metadata
//! - [`TransportError`]: Unified error type with tracing context
//!
//! A typical stack encodes the envelope as JSON before it reaches the backend:
//!
//! ```rust
//! use postroute::transport::{InMemory, RawPayload, Transport, layers::JsonLayer};
//!
//! let transport = Transport::new(InMemory::<RawPayload>::default()).layer(JsonLayer);
//! # let _ = transport;
//! ```
//!
//! Publishing is not retried here. Redelivery is the job of the consumer loop
//! and the retry topology.

mod inmemory;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use serde_json::{Map, Value};
use tower::Service;
use tracing_error::SpanTrace;

use crate::{Envelope, Metadata, ValidationError};

pub use inmemory::InMemory;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for publishing envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::classify(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::classify(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Transport<S> {
    /// Publish an [`Envelope`] through the transport.
    #[tracing::instrument(skip_all)]
    pub async fn send<M>(&mut self, envelope: Envelope<M>) -> Result<(), TransportError>
    where
        M: Send + 'static,
        S: Service<Envelope<M>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::classify(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The envelope metadata does not describe a valid publish.
    Validation(ValidationError),
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    pub fn validation(err: ValidationError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Validation(err),
        }
    }

    /// Sort a boxed error coming out of the service stack into its kind.
    fn classify(err: tower::BoxError) -> Self {
        let err = match err.downcast::<TransportError>() {
            Ok(err) => return *err,
            Err(err) => err,
        };
        let err = match err.downcast::<ValidationError>() {
            Ok(err) => return Self::validation(*err),
            Err(err) => err,
        };
        if err.is::<serde_json::Error>() {
            return Self::serde(err);
        }
        Self::sender(err)
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Validation(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Validation(err) => writeln!(f, "Validation error: {err}"),
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Validation(err) => Some(err),
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower's `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<M, D> Service<Envelope<M>> for SenderService<D>
where
    M: Send + 'static,
    D: Sender<M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope<M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete sender backends.
///
/// A sender is responsible for delivering an [`Envelope`] to a broker.
/// Delivery properties come from the envelope metadata; see
/// [`DeliveryProperties::from_metadata`].
#[async_trait::async_trait]
pub trait Sender<M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send an envelope using the underlying transport.
    async fn send(&mut self, envelope: Envelope<M>) -> Result<(), Self::Error>;
}

/// Broker-level properties of a single publish.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryProperties {
    /// Target exchange. Never blank.
    pub exchange: String,
    pub routing_key: String,
    /// Broker message headers.
    pub headers: Option<Map<String, Value>>,
    /// Per-message time-to-live.
    pub expiration: Option<Duration>,
}

impl DeliveryProperties {
    /// Read `exchange` (required), `routing_key` (default empty), `headers`
    /// and `expiration` from the metadata.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ValidationError> {
        Ok(Self {
            exchange: metadata.exchange()?.to_owned(),
            routing_key: metadata.routing_key()?.to_owned(),
            headers: metadata.headers()?.cloned(),
            expiration: metadata.expiration()?,
        })
    }
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload(Vec<u8>);

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl RawPayload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handling payloads.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for [u8] {
    fn to_bytes(&self) -> &[u8] {
        self
    }
}

impl ToBytes for str {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for String {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<T: ToBytes + ?Sized> ToBytes for &T {
    fn to_bytes(&self) -> &[u8] {
        (*self).to_bytes()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        self.0.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Message, metadata::ValidationErrorKind};

    #[test]
    fn delivery_properties_follow_metadata() {
        let metadata = Metadata::new()
            .with("exchange", "jobs")
            .with("routing_key", "email")
            .with("headers", json!({"tenant": "acme"}))
            .with("expiration", 5000);

        let properties = DeliveryProperties::from_metadata(&metadata).unwrap();

        assert_eq!(properties.exchange, "jobs");
        assert_eq!(properties.routing_key, "email");
        assert_eq!(properties.headers.unwrap()["tenant"], "acme");
        assert_eq!(properties.expiration, Some(Duration::from_secs(5)));
    }

    #[test]
    fn delivery_properties_require_an_exchange() {
        let err = DeliveryProperties::from_metadata(&Metadata::new().with("exchange", ""))
            .unwrap_err();
        assert_eq!(err.kind(), ValidationErrorKind::Blank);

        let properties =
            DeliveryProperties::from_metadata(&Metadata::new().with("exchange", "jobs")).unwrap();
        assert_eq!(properties.routing_key, "");
        assert_eq!(properties.headers, None);
        assert_eq!(properties.expiration, None);
    }

    #[tokio::test]
    async fn validation_failures_keep_their_kind() {
        let mut transport =
            Transport::new(crate::InMemoryBroker::default()).layer(layers::JsonLayer);

        let err = transport
            .send(Envelope::new(Message::new("Ping"), Metadata::new()))
            .await
            .unwrap_err();

        assert!(err.is_validation());
    }
}

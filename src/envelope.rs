use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing_error::SpanTrace;

use crate::Metadata;

/// Message container used by the transport and the consumer loop.
///
/// `Envelope` bundles a message payload together with its [`Metadata`]. On the
/// wire it is a JSON object `{ "message": {...}, "metadata": {...} }`.
///
/// ## Design
///
/// - `M` is the payload. Applications work with [`Message`]; the transport
///   stack swaps it for raw bytes once the envelope has been encoded.
/// - Metadata travels next to the payload so backends can derive delivery
///   properties (exchange, routing key, headers, expiration) without decoding
///   the message.
///
/// Envelopes are values: changing the metadata produces a new envelope via
/// [`Envelope::with_metadata`].
///
/// ## Example
///
/// ```rust
/// use postroute::{Envelope, Message, Metadata};
///
/// let envelope = Envelope::new(
///     Message::new("SendEmail"),
///     Metadata::new().with("job", "email.send").with("exchange", "jobs"),
/// );
///
/// let bytes = envelope.to_vec().unwrap();
/// assert_eq!(Envelope::from_slice(&bytes).unwrap(), envelope);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M = Message> {
    /// Message payload.
    pub message: M,
    /// Message metadata.
    pub metadata: Metadata,
}

impl<M> Envelope<M> {
    pub fn new(message: M, metadata: Metadata) -> Self {
        Self { message, metadata }
    }

    /// Copy the envelope, replacing its metadata.
    pub fn with_metadata(&self, metadata: Metadata) -> Self
    where
        M: Clone,
    {
        Self {
            message: self.message.clone(),
            metadata,
        }
    }
}

impl Envelope<Message> {
    /// Decode an envelope from its JSON wire form.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MalformedMessageError> {
        serde_json::from_slice(bytes).map_err(MalformedMessageError::new)
    }

    /// Encode the envelope into its JSON wire form.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<M> From<(M, Metadata)> for Envelope<M> {
    fn from(value: (M, Metadata)) -> Self {
        Envelope {
            message: value.0,
            metadata: value.1,
        }
    }
}

const TYPE: &str = "type";

/// Application message: a type tag plus an opaque payload.
///
/// The payload fields sit next to `type` in the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field. `type` is reserved for the message kind and is
    /// ignored here.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != TYPE {
            self.payload.insert(key, value.into());
        }
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }
}

/// A delivery body could not be decoded into an [`Envelope`].
#[derive(Debug)]
pub struct MalformedMessageError {
    context: SpanTrace,
    source: serde_json::Error,
}

impl MalformedMessageError {
    fn new(source: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            source,
        }
    }
}

impl std::fmt::Display for MalformedMessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Malformed message: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for MalformedMessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

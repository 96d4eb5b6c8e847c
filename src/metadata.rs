//! Key-value context carried alongside every message.
//!
//! Metadata is an insertion-ordered map of JSON values. A handful of keys are
//! reserved and interpreted by the transport and the consumer loop; see the
//! constants in this module. Everything else is passed through untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the job a message is dispatched to.
pub const JOB: &str = "job";
/// Exchange a message is published to.
pub const EXCHANGE: &str = "exchange";
/// Routing key used when publishing. Defaults to the empty string.
pub const ROUTING_KEY: &str = "routing_key";
/// Optional map of broker message headers.
pub const HEADERS: &str = "headers";
/// Optional per-message time-to-live in milliseconds.
pub const EXPIRATION: &str = "expiration";
/// Number of times the message has been retried.
pub const RETRIES: &str = "_retries";
/// Logical channel the message belongs to; selects the retry route.
pub const CHANNEL: &str = "_channel";
/// Error recorded on messages escalated after a terminal failure.
pub const ERROR_MESSAGE: &str = "_error_message";

/// Message metadata.
///
/// Values are never mutated in place: [`Metadata::with`] returns a modified
/// copy, so an envelope that has been handed to a transport keeps the context
/// it was published with.
///
/// ```rust
/// use postroute::Metadata;
///
/// let metadata = Metadata::new()
///     .with("job", "email.send")
///     .with("exchange", "jobs");
/// let retried = metadata.with("_retries", 1);
///
/// assert_eq!(metadata.retries().unwrap(), 0);
/// assert_eq!(retried.retries().unwrap(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Return a copy of this metadata with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = self.0.clone();
        map.insert(key.into(), value.into());
        Self(map)
    }

    /// Return a copy of this metadata without `key`.
    pub fn without(&self, key: &str) -> Self {
        let mut map = self.0.clone();
        map.shift_remove(key);
        Self(map)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fetch a required, non-blank string value.
    pub fn require_str(&self, key: &str) -> Result<&str, ValidationError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Err(ValidationError::missing(key)),
            Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::blank(key)),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(ValidationError::invalid_type(key, "string")),
        }
    }

    /// Fetch an optional string value. Blank strings count as absent.
    pub fn optional_str(&self, key: &str) -> Result<Option<&str>, ValidationError> {
        match self.require_str(key) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == ValidationErrorKind::InvalidType => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub fn job(&self) -> Result<&str, ValidationError> {
        self.require_str(JOB)
    }

    pub fn exchange(&self) -> Result<&str, ValidationError> {
        self.require_str(EXCHANGE)
    }

    pub fn routing_key(&self) -> Result<&str, ValidationError> {
        match self.0.get(ROUTING_KEY) {
            None | Some(Value::Null) => Ok(""),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(ValidationError::invalid_type(ROUTING_KEY, "string")),
        }
    }

    pub fn channel(&self) -> Result<Option<&str>, ValidationError> {
        self.optional_str(CHANNEL)
    }

    pub fn headers(&self) -> Result<Option<&Map<String, Value>>, ValidationError> {
        match self.0.get(HEADERS) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(ValidationError::invalid_type(HEADERS, "map")),
        }
    }

    /// Per-message time-to-live. Accepts an integer or a decimal string of
    /// milliseconds, the latter being how AMQP itself carries the value.
    pub fn expiration(&self) -> Result<Option<Duration>, ValidationError> {
        let millis = match self.0.get(EXPIRATION) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            Some(_) => None,
        };
        millis
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| ValidationError::invalid_type(EXPIRATION, "non-negative integer"))
    }

    pub fn retries(&self) -> Result<u32, ValidationError> {
        match self.0.get(RETRIES) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| ValidationError::invalid_type(RETRIES, "non-negative integer")),
            Some(_) => Err(ValidationError::invalid_type(RETRIES, "non-negative integer")),
        }
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A required metadata field is missing, blank, of the wrong type, or refers
/// to something that does not exist.
///
/// Messages failing validation are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    key: String,
    detail: Option<String>,
    kind: ValidationErrorKind,
}

/// Validation error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    Missing,
    Blank,
    InvalidType,
    /// The value names a job that is not in the registry.
    Unregistered,
}

impl ValidationError {
    pub fn missing(key: &str) -> Self {
        Self::new(key, ValidationErrorKind::Missing, None)
    }

    pub fn blank(key: &str) -> Self {
        Self::new(key, ValidationErrorKind::Blank, None)
    }

    pub fn unregistered(key: &str, value: &str) -> Self {
        Self::new(key, ValidationErrorKind::Unregistered, Some(value.to_owned()))
    }

    fn invalid_type(key: &str, expected: &str) -> Self {
        Self::new(
            key,
            ValidationErrorKind::InvalidType,
            Some(format!("expected {expected}")),
        )
    }

    fn new(key: &str, kind: ValidationErrorKind, detail: Option<String>) -> Self {
        Self {
            key: key.to_owned(),
            detail,
            kind,
        }
    }

    /// The offending metadata key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> ValidationErrorKind {
        self.kind
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ValidationErrorKind::Missing => write!(f, "Missing metadata field `{}`", self.key),
            ValidationErrorKind::Blank => write!(f, "Blank metadata field `{}`", self.key),
            ValidationErrorKind::InvalidType => write!(f, "Invalid metadata field `{}`", self.key),
            ValidationErrorKind::Unregistered => {
                write!(f, "Metadata field `{}` names an unregistered job", self.key)
            }
        }?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

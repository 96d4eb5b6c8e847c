use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tracing_error::SpanTrace;
use urlencoding::encode;

use crate::{
    config::Config,
    topology::{
        BindingSpec, DeclareTopology, ExchangeSpec, ForwardingLink, ForwardingLinks, QueueSpec,
    },
};

/// Client for the RabbitMQ management HTTP API.
///
/// Implements both [`DeclareTopology`] and [`ForwardingLinks`], so a single
/// client can provision a whole channel:
///
/// ```rust,no_run
/// use postroute::topology::{DEFAULT_REPUB_INTERVAL, Topology, management::ManagementClient};
///
/// # async fn provision() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ManagementClient::new("http://localhost:15672", "/", "guest", "guest");
/// let topology = Topology::new(client.clone(), client);
/// topology.provision_channel("jobs", DEFAULT_REPUB_INTERVAL).await?;
/// # Ok(())
/// # }
/// ```
///
/// Forwarding links are dynamic shovels (`/api/parameters/shovel`) between
/// two entities of the same broker; the shovel plugin must be enabled.
#[derive(Clone, Debug)]
pub struct ManagementClient {
    http: reqwest::Client,
    base_url: String,
    vhost: String,
    user: String,
    password: String,
}

impl ManagementClient {
    pub fn new(
        base_url: impl Into<String>,
        vhost: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            vhost: vhost.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.management_url,
            &config.vhost,
            &config.management_user,
            &config.management_password,
        )
    }

    fn url(&self, collection: &str, name: &str) -> String {
        format!(
            "{}/api/{collection}/{}/{}",
            self.base_url,
            encode(&self.vhost),
            encode(name)
        )
    }

    async fn request(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<StatusCode, ManagementError> {
        tracing::debug!(%method, %url, "Management API request");
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.user, Some(&self.password));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(ManagementError::http)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ManagementError::status(status, body))
    }

    /// Like [`request`](Self::request) but a 404 is an error.
    async fn expect_success(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<(), ManagementError> {
        let status = self.request(method, url, body).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ManagementError::status(status, String::new()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeclareTopology for ManagementClient {
    type Error = ManagementError;

    #[tracing::instrument(skip_all, fields(exchange = %exchange.name))]
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), Self::Error> {
        self.expect_success(
            Method::PUT,
            self.url("exchanges", &exchange.name),
            Some(exchange_body(exchange)),
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(queue = %queue.name))]
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), Self::Error> {
        self.expect_success(
            Method::PUT,
            self.url("queues", &queue.name),
            Some(queue_body(queue)),
        )
        .await
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), Self::Error> {
        let url = format!(
            "{}/api/bindings/{}/e/{}/q/{}",
            self.base_url,
            encode(&self.vhost),
            encode(&binding.exchange),
            encode(&binding.queue)
        );
        self.expect_success(
            Method::POST,
            url,
            Some(json!({ "routing_key": binding.routing_key, "arguments": {} })),
        )
        .await
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), Self::Error> {
        self.request(Method::DELETE, self.url("exchanges", name), None)
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Self::Error> {
        self.request(Method::DELETE, self.url("queues", name), None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ForwardingLinks for ManagementClient {
    type Error = ManagementError;

    #[tracing::instrument(skip_all, fields(link = %link.name))]
    async fn create_link(&self, link: &ForwardingLink) -> Result<(), Self::Error> {
        self.expect_success(
            Method::PUT,
            self.url("parameters/shovel", &link.name),
            Some(shovel_body(link)),
        )
        .await
    }

    async fn delete_link(&self, name: &str) -> Result<(), Self::Error> {
        self.request(Method::DELETE, self.url("parameters/shovel", name), None)
            .await?;
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> Result<bool, Self::Error> {
        let status = self
            .request(Method::GET, self.url("parameters/shovel", name), None)
            .await?;
        Ok(status != StatusCode::NOT_FOUND)
    }
}

fn exchange_body(exchange: &ExchangeSpec) -> Value {
    json!({
        "type": exchange.kind.as_str(),
        "durable": exchange.durable,
        "auto_delete": exchange.auto_delete,
        "internal": exchange.internal,
        "arguments": exchange.arguments,
    })
}

fn queue_body(queue: &QueueSpec) -> Value {
    json!({
        "durable": queue.durable,
        "exclusive": queue.exclusive,
        "auto_delete": queue.auto_delete,
        "arguments": queue.arguments,
    })
}

// `amqp://` points the shovel at the broker it runs on.
fn shovel_body(link: &ForwardingLink) -> Value {
    json!({
        "value": {
            "src-protocol": "amqp091",
            "src-uri": "amqp://",
            "src-queue": link.source_queue,
            "dest-protocol": "amqp091",
            "dest-uri": "amqp://",
            "dest-exchange": link.destination_exchange,
            "add-forward-headers": false,
            "ack-mode": "on-confirm",
            "src-delete-after": "never",
        }
    })
}

/// Error returned by the management API client.
#[derive(Debug)]
pub struct ManagementError {
    context: SpanTrace,
    kind: ManagementErrorKind,
}

#[derive(Debug)]
pub enum ManagementErrorKind {
    /// The request could not be sent or its response not read.
    Http(reqwest::Error),
    /// The API answered with an unexpected status.
    Status { status: StatusCode, body: String },
}

impl ManagementError {
    fn http(err: reqwest::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ManagementErrorKind::Http(err),
        }
    }

    fn status(status: StatusCode, body: String) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ManagementErrorKind::Status { status, body },
        }
    }

    pub fn kind(&self) -> &ManagementErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ManagementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ManagementErrorKind::Http(err) => writeln!(f, "Management API request failed: {err}"),
            ManagementErrorKind::Status { status, body } => {
                writeln!(f, "Management API returned {status}: {body}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ManagementError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ManagementErrorKind::Http(err) => Some(err),
            ManagementErrorKind::Status { .. } => None,
        }
    }
}

use std::time::Duration;

use serde::Deserialize;

/// Connection settings, read from `POSTROUTE_*` environment variables.
///
/// | variable                         | default                     |
/// |----------------------------------|-----------------------------|
/// | `POSTROUTE_AMQP_URI`             | `amqp://127.0.0.1:5672/%2f` |
/// | `POSTROUTE_MANAGEMENT_URL`       | `http://127.0.0.1:15672`    |
/// | `POSTROUTE_MANAGEMENT_USER`      | `guest`                     |
/// | `POSTROUTE_MANAGEMENT_PASSWORD`  | `guest`                     |
/// | `POSTROUTE_VHOST`                | `/`                         |
/// | `POSTROUTE_REPUB_INTERVAL_MS`    | `30000`                     |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub amqp_uri: String,
    pub management_url: String,
    pub management_user: String,
    pub management_password: String,
    pub vhost: String,
    pub repub_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("POSTROUTE_").from_env::<Self>()
    }

    /// How long unroutable messages wait before they are routed again.
    pub fn repub_interval(&self) -> Duration {
        Duration::from_millis(self.repub_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            amqp_uri: "amqp://127.0.0.1:5672/%2f".to_owned(),
            management_url: "http://127.0.0.1:15672".to_owned(),
            management_user: "guest".to_owned(),
            management_password: "guest".to_owned(),
            vhost: "/".to_owned(),
            repub_interval_ms: 30_000,
        }
    }
}

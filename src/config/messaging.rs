//! Messaging configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::publisher::DEFAULT_PUBLISH_TIMEOUT;
use crate::bus::{ConnectionMode, PublisherOptions, DEFAULT_CONTENT_TYPE};

/// Broker and publisher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP endpoint URI. Usually supplied through `RABBITMQ_ENDPOINT`.
    pub endpoint: Option<String>,
    /// Connection handling.
    pub mode: ConnectionMode,
    /// Bound for dialing the broker, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bound for a whole publish call, in milliseconds.
    pub publish_timeout_ms: u64,
    /// Maximum pooled connections.
    pub pool_max_size: usize,
    /// Wait for broker confirms before reporting success.
    pub confirms: bool,
    /// Content type for raw payloads.
    pub content_type: String,
    /// Publish messages as persistent.
    pub persistent: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            mode: ConnectionMode::Pooled,
            connect_timeout_ms: 5_000,
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT.as_millis() as u64,
            pool_max_size: 10,
            confirms: false,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            persistent: true,
        }
    }
}

impl MessagingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Publisher options, stamping `app_id` with the service name.
    pub fn publisher_options(&self, service_name: &str) -> PublisherOptions {
        PublisherOptions {
            publish_timeout: self.publish_timeout(),
            content_type: self.content_type.clone(),
            persistent: self.persistent,
            app_id: Some(service_name.to_string()),
        }
    }

    #[cfg(feature = "amqp")]
    pub fn amqp_options(&self) -> crate::bus::AmqpOptions {
        crate::bus::AmqpOptions {
            connect_timeout: self.connect_timeout(),
            pool_max_size: self.pool_max_size,
            mode: self.mode,
            confirms: self.confirms,
        }
    }
}

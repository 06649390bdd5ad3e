//! ecom-publish: publish one catalog event to RabbitMQ.
//!
//! ## Usage
//! ```text
//! ecom-publish <event-kind> [routing-key] [payload]
//! ```
//! The routing key defaults to the kind's catalog key. The payload is read
//! from stdin when omitted.
//!
//! ## Configuration
//! - RABBITMQ_ENDPOINT: broker URI (required)
//! - ECOM_EVENTS_CONFIG: optional YAML config file
//! - ECOM_LOG / ECOM_LOG_FORMAT: logging

use std::io::Read;
use std::sync::Arc;

use tracing::info;

use ecom_events::bus::{validate_endpoint, AmqpChannelManager, EventPublisher, Publisher};
use ecom_events::catalog::EventKind;
use ecom_events::config::Config;
use ecom_events::utils::bootstrap::init_tracing;
use ecom_events::utils::retry::{connect_with_retry, connection_backoff};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let kind: EventKind = match args.next() {
        Some(token) => token.parse()?,
        None => {
            let kinds: Vec<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
            return Err(format!(
                "usage: ecom-publish <event-kind> [routing-key] [payload]\nkinds: {}",
                kinds.join(", ")
            )
            .into());
        }
    };
    let routing_key = args
        .next()
        .unwrap_or_else(|| kind.default_routing_key().to_string());
    let payload = match args.next() {
        Some(payload) => payload.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let config = Config::load(None)?;
    let endpoint = config.endpoint()?;
    validate_endpoint(endpoint)?;

    let options = config.messaging.amqp_options();
    let manager = connect_with_retry("rabbitmq", connection_backoff(), || {
        AmqpChannelManager::connect(endpoint, options.clone())
    })
    .await?;

    let publisher = Publisher::new(
        Arc::new(manager),
        config.messaging.publisher_options(&config.service.name),
    );

    let result = publisher.publish(kind, &routing_key, &payload).await;
    publisher.close().await?;
    result?;

    info!(event = %kind, routing_key = %routing_key, bytes = payload.len(), "Event published");
    Ok(())
}

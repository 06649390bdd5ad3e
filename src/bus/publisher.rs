//! Publisher: the single entry point for emitting catalog events.
//!
//! Each publish leases a fresh channel, declares the kind's exchange, sends
//! once and releases the channel on every exit path. The whole sequence is
//! bounded by one timeout. No retry happens here; a failed attempt is
//! reported to the caller as-is (at-most-once, best effort).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{
    BrokerChannel, BusError, ChannelManager, EventPublisher, Message, PublishStage, Result,
    DEFAULT_CONTENT_TYPE,
};
use crate::catalog::EventKind;

/// Bound for a whole publish call (connect, declare, send).
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Upper bound for one publish call.
    pub publish_timeout: Duration,
    /// Content type for `publish` (raw payloads).
    pub content_type: String,
    /// Mark messages persistent.
    pub persistent: bool,
    /// Stamped into `app_id` when the message has none.
    pub app_id: Option<String>,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            persistent: true,
            app_id: None,
        }
    }
}

/// Publishes catalog events through a `ChannelManager`.
///
/// The manager is injected, so handlers can be built against `MockBroker`
/// in tests and `AmqpChannelManager` in production.
#[derive(Clone)]
pub struct Publisher {
    manager: Arc<dyn ChannelManager>,
    options: PublisherOptions,
}

impl Publisher {
    pub fn new(manager: Arc<dyn ChannelManager>, options: PublisherOptions) -> Self {
        Self { manager, options }
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    /// Publish with the kind's default routing key.
    pub async fn publish_default(&self, kind: EventKind, payload: &[u8]) -> Result<()> {
        self.publish(kind, kind.default_routing_key(), payload).await
    }

    /// Publish bounded by the earlier of `deadline` and the publish timeout.
    ///
    /// Lets a request handler pass its own deadline down so a slow broker
    /// cannot outlive the request.
    pub async fn publish_until(
        &self,
        kind: EventKind,
        routing_key: &str,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<()> {
        let message = self.raw_message(routing_key, payload);
        self.send(kind, message, Some(deadline)).await
    }

    /// Shut down the underlying connection.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }

    fn raw_message(&self, routing_key: &str, payload: &[u8]) -> Message {
        let mut message =
            Message::new(routing_key, payload).with_content_type(&self.options.content_type);
        message.persistent = self.options.persistent;
        message
    }

    fn stamp(&self, mut message: Message) -> Message {
        if message.message_id.is_none() {
            message.message_id = Some(uuid::Uuid::new_v4().to_string());
        }
        if message.timestamp.is_none() {
            message.timestamp = u64::try_from(chrono::Utc::now().timestamp()).ok();
        }
        if message.app_id.is_none() {
            message.app_id = self.options.app_id.clone();
        }
        message
    }

    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(event = %kind, routing_key = %message.routing_key)
    )]
    async fn send(
        &self,
        kind: EventKind,
        message: Message,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let now = Instant::now();
        let bound = match deadline {
            Some(deadline) => self
                .options
                .publish_timeout
                .min(deadline.saturating_duration_since(now)),
            None => self.options.publish_timeout,
        };
        let deadline = now + bound;
        let message = self.stamp(message);

        let mut lease: Option<ChannelLease> = None;
        let mut stage = PublishStage::Idle;

        let outcome = tokio::time::timeout_at(
            deadline,
            self.run(kind, &message, &mut lease, &mut stage),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(BusError::SendTimeout {
                stage,
                timeout: bound,
            }),
        };

        match &result {
            Ok(()) => advance(&mut stage, PublishStage::Sent),
            Err(e) => {
                warn!(error = %e, stage = %stage, "Publish failed");
                advance(&mut stage, PublishStage::Failed);
            }
        }

        if let Some(lease) = lease.take() {
            if let Err(e) = lease.release_until(deadline).await {
                warn!(error = %e, "Failed to close channel");
            }
        }
        advance(&mut stage, PublishStage::Closed);

        if result.is_ok() {
            debug!(
                exchange = kind.exchange_name(),
                message_id = message.message_id.as_deref().unwrap_or_default(),
                "Published event"
            );
        }
        result
    }

    async fn run(
        &self,
        kind: EventKind,
        message: &Message,
        lease: &mut Option<ChannelLease>,
        stage: &mut PublishStage,
    ) -> Result<()> {
        let declaration = kind.declaration();

        advance(stage, PublishStage::Connecting);
        let channel = self.manager.open_channel().await?;
        let lease = lease.insert(ChannelLease::new(channel));
        advance(stage, PublishStage::ChannelOpen);

        lease.channel()?.declare_exchange(&declaration).await?;
        advance(stage, PublishStage::TopologyDeclared);

        advance(stage, PublishStage::Sending);
        lease.channel()?.publish(&declaration.name, message).await
    }
}

fn advance(stage: &mut PublishStage, next: PublishStage) {
    trace!(from = %stage, to = %next, "Publish stage");
    *stage = next;
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish(&self, kind: EventKind, routing_key: &str, payload: &[u8]) -> Result<()> {
        let message = self.raw_message(routing_key, payload);
        self.publish_message(kind, message).await
    }

    async fn publish_message(&self, kind: EventKind, message: Message) -> Result<()> {
        self.send(kind, message, None).await
    }
}

// ============================================================================
// Channel lease
// ============================================================================

/// Exclusive ownership of one broker channel for the duration of a publish.
///
/// `release` closes the channel. `release_until` stops waiting at a deadline
/// and lets the close finish on a background task. A lease dropped without
/// either (the publish future was cancelled) closes its channel on a
/// background task.
pub struct ChannelLease {
    channel: Option<Box<dyn BrokerChannel>>,
}

impl ChannelLease {
    pub fn new(channel: Box<dyn BrokerChannel>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    pub fn channel(&self) -> Result<&dyn BrokerChannel> {
        self.channel
            .as_deref()
            .ok_or_else(|| BusError::Channel("Channel lease already released".to_string()))
    }

    /// Close the channel now.
    pub async fn release(mut self) -> Result<()> {
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    /// Close the channel, waiting no later than `deadline`.
    ///
    /// The close is polled at least once even when the deadline has passed.
    /// If it is still pending at the deadline it keeps running in the
    /// background; the channel is never dropped unclosed.
    pub async fn release_until(mut self, deadline: Instant) -> Result<()> {
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };

        let mut close: CloseFuture = Box::pin(async move { channel.close().await });
        match tokio::time::timeout_at(deadline, &mut close).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Channel close outlived the deadline, finishing in background");
                close_in_background(close);
                Ok(())
            }
        }
    }
}

type CloseFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

fn close_in_background(close: CloseFuture) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = close.await {
                    warn!(error = %e, "Failed to close abandoned channel");
                }
            });
        }
        Err(_) => warn!("No runtime available, channel not closed"),
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };

        debug!("Closing abandoned channel in background");
        close_in_background(Box::pin(async move { channel.close().await }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBroker, PublishStage};

    fn publisher(broker: &Arc<MockBroker>, timeout: Duration) -> Publisher {
        Publisher::new(
            broker.clone(),
            PublisherOptions {
                publish_timeout: timeout,
                app_id: Some("order-service".to_string()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_publish_declares_and_sends() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);

        publisher
            .publish(EventKind::OrderCreated, "order-process", br#"{"orderId":"abc123"}"#)
            .await
            .unwrap();

        assert!(broker.exchange("order-created").await.is_some());

        let published = broker.take_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "order-created");
        assert_eq!(published[0].message.routing_key, "order-process");
        assert_eq!(published[0].message.body, br#"{"orderId":"abc123"}"#.to_vec());
        assert_eq!(published[0].message.content_type, "text/plain");
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_publish_stamps_metadata() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);

        publisher
            .publish_default(EventKind::ProductCreated, b"p-1")
            .await
            .unwrap();

        let published = broker.take_published().await;
        let message = &published[0].message;
        assert_eq!(message.routing_key, "product-created");
        assert!(message.message_id.is_some());
        assert!(message.timestamp.is_some());
        assert_eq!(message.app_id.as_deref(), Some("order-service"));
        assert!(message.persistent);
    }

    #[tokio::test]
    async fn test_publish_message_keeps_caller_content_type() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);

        let message = Message::new("cart", b"{}".to_vec()).with_content_type("application/json");
        publisher
            .publish_message(EventKind::CartUpdated, message)
            .await
            .unwrap();

        let published = broker.take_published().await;
        assert_eq!(published[0].message.content_type, "application/json");
    }

    #[tokio::test]
    async fn test_timeout_reports_stage_and_releases_channel() {
        let broker = Arc::new(MockBroker::new());
        broker.set_send_delay(Some(Duration::from_millis(500))).await;
        let publisher = publisher(&broker, Duration::from_millis(50));

        let err = publisher
            .publish(EventKind::OrderCreated, "order-process", b"slow")
            .await
            .unwrap_err();

        match err {
            BusError::SendTimeout { stage, timeout } => {
                assert_eq!(stage, PublishStage::Sending);
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected SendTimeout, got {other:?}"),
        }
        assert_eq!(broker.open_channels(), 0);
        assert!(broker.take_published().await.is_empty());
    }

    #[tokio::test]
    async fn test_caller_deadline_shortens_bound() {
        let broker = Arc::new(MockBroker::new());
        broker.set_send_delay(Some(Duration::from_millis(500))).await;
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);

        let started = Instant::now();
        let deadline = started + Duration::from_millis(30);
        let err = publisher
            .publish_until(EventKind::OrderUpdated, "order-updated", b"x", deadline)
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::SendTimeout { .. }));
        assert!(started.elapsed() < DEFAULT_PUBLISH_TIMEOUT);
        assert_eq!(broker.open_channels(), 0);
    }

    async fn wait_for_no_open_channels(broker: &MockBroker, within: Duration) {
        let until = Instant::now() + within;
        while broker.open_channels() > 0 && Instant::now() < until {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_slow_close_does_not_outlive_caller_deadline() {
        let broker = Arc::new(MockBroker::new());
        broker.set_send_delay(Some(Duration::from_secs(30))).await;
        broker.set_close_delay(Some(Duration::from_millis(500))).await;
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);

        let started = Instant::now();
        let err = publisher
            .publish_until(
                EventKind::OrderCreated,
                "order-process",
                b"x",
                started + Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BusError::SendTimeout {
                stage: PublishStage::Sending,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_millis(400));

        // The close continues after the call returned and still completes.
        wait_for_no_open_channels(&broker, Duration::from_secs(2)).await;
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_slow_close_after_success_is_finished_in_background() {
        let broker = Arc::new(MockBroker::new());
        broker.set_close_delay(Some(Duration::from_millis(300))).await;
        let publisher = publisher(&broker, Duration::from_millis(100));

        let started = Instant::now();
        publisher
            .publish_default(EventKind::SellerUpdated, b"s")
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(broker.published_count().await, 1);

        wait_for_no_open_channels(&broker, Duration::from_secs(2)).await;
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_release_until_expired_deadline_still_closes_fast_channel() {
        let broker = MockBroker::new();
        let lease = ChannelLease::new(broker.open_channel().await.unwrap());

        lease.release_until(Instant::now()).await.unwrap();
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_publish_closes_channel_in_background() {
        let broker = Arc::new(MockBroker::new());
        broker.set_send_delay(Some(Duration::from_secs(10))).await;
        let publisher = publisher(&broker, Duration::from_secs(30));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            publisher.publish(EventKind::SellerCreated, "seller-created", b"s"),
        )
        .await;
        assert!(cancelled.is_err());

        for _ in 0..20 {
            if broker.open_channels() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let broker = Arc::new(MockBroker::new());
        broker.set_unreachable(true).await;
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);

        let err = publisher
            .publish_default(EventKind::OrderCreated, b"x")
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Connection(_)));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_topology_conflict_fails_publish_and_releases() {
        let broker = Arc::new(MockBroker::new());
        broker
            .preload_exchange(crate::bus::ExchangeDeclaration {
                durable: false,
                ..EventKind::OrderCanceled.declaration()
            })
            .await;
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);

        let err = publisher
            .publish_default(EventKind::OrderCanceled, b"x")
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Topology { .. }));
        assert!(!err.is_retryable());
        assert_eq!(broker.open_channels(), 0);
        assert!(broker.take_published().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_manager_is_channel_error() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker, DEFAULT_PUBLISH_TIMEOUT);
        publisher.close().await.unwrap();

        let err = publisher
            .publish_default(EventKind::CartDeleted, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Channel(_)));
    }

    #[tokio::test]
    async fn test_release_closes_channel() {
        let broker = MockBroker::new();
        let lease = ChannelLease::new(broker.open_channel().await.unwrap());
        assert_eq!(broker.open_channels(), 1);

        lease.release().await.unwrap();
        assert_eq!(broker.open_channels(), 0);
    }
}

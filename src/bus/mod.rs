//! Event bus for publishing domain events to a message broker.
//!
//! This module contains:
//! - `ChannelManager` / `BrokerChannel` traits: broker connection and channel leasing
//! - `EventPublisher` trait and the `Publisher` that implements it
//! - Topology and message types shared by every backend
//! - Implementations: AMQP (RabbitMQ), Mock

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::catalog::EventKind;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;
pub mod publisher;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{validate_endpoint, AmqpChannelManager, AmqpOptions};
pub use mock::MockBroker;
pub use publisher::{ChannelLease, Publisher, PublisherOptions};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur while publishing.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable, credentials rejected, handshake timed out or
    /// endpoint malformed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Channel could not be opened or became unusable.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Exchange already exists with different properties.
    #[error("Topology conflict on exchange '{exchange}': {message}")]
    Topology { exchange: String, message: String },

    /// The publish did not complete within its bound.
    #[error("Publish timed out after {timeout:?} while {stage}")]
    SendTimeout {
        stage: PublishStage,
        timeout: Duration,
    },

    /// Broker negatively acknowledged the message (confirms enabled).
    #[error("Broker rejected message on exchange '{exchange}'")]
    Nacked { exchange: String },
}

impl BusError {
    /// Whether a caller may reasonably try the same publish again.
    ///
    /// Topology conflicts need a catalog change and never succeed on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BusError::Topology { .. })
    }
}

// ============================================================================
// Topology
// ============================================================================

/// AMQP exchange kinds the publisher can declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// Exchange declaration.
///
/// Declaring the same exchange twice with equal properties is a no-op.
/// Declaring it with different properties must fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl ExchangeDeclaration {
    /// Durable direct exchange, the shape every catalog entry uses.
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }

    /// Human readable list of properties that differ from `other`.
    pub fn differences(&self, other: &ExchangeDeclaration) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.kind != other.kind {
            diffs.push(format!("kind {} != {}", self.kind.as_str(), other.kind.as_str()));
        }
        if self.durable != other.durable {
            diffs.push(format!("durable {} != {}", self.durable, other.durable));
        }
        if self.auto_delete != other.auto_delete {
            diffs.push(format!(
                "auto_delete {} != {}",
                self.auto_delete, other.auto_delete
            ));
        }
        if self.internal != other.internal {
            diffs.push(format!("internal {} != {}", self.internal, other.internal));
        }
        diffs
    }
}

/// How the AMQP channel manager holds broker connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// A long-lived pool; each publish leases a fresh channel.
    #[default]
    Pooled,
    /// Dial, publish and close a connection for every publish.
    PerCall,
}

// ============================================================================
// Messages
// ============================================================================

/// Content type used when the caller does not choose one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// A message ready to be sent. The body is opaque to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Unique id stamped by the publisher.
    pub message_id: Option<String>,
    /// Unix seconds stamped by the publisher.
    pub timestamp: Option<u64>,
    /// Name of the emitting service.
    pub app_id: Option<String>,
    /// Ask the broker to persist the message (delivery mode 2).
    pub persistent: bool,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            body: body.into(),
            message_id: None,
            timestamp: None,
            app_id: None,
            persistent: true,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

// ============================================================================
// Publish state machine
// ============================================================================

/// Stages of a single publish call.
///
/// `Idle -> Connecting -> ChannelOpen -> TopologyDeclared -> Sending -> {Sent | Failed} -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    Idle,
    Connecting,
    ChannelOpen,
    TopologyDeclared,
    Sending,
    Sent,
    Failed,
    Closed,
}

impl PublishStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishStage::Sent | PublishStage::Failed)
    }
}

impl fmt::Display for PublishStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishStage::Idle => "idle",
            PublishStage::Connecting => "connecting",
            PublishStage::ChannelOpen => "channel open",
            PublishStage::TopologyDeclared => "topology declared",
            PublishStage::Sending => "sending",
            PublishStage::Sent => "sent",
            PublishStage::Failed => "failed",
            PublishStage::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Source of broker channels.
///
/// Implementations:
/// - `AmqpChannelManager`: RabbitMQ via lapin, pooled or per-call connections
/// - `MockBroker`: in-memory broker for testing
#[async_trait]
pub trait ChannelManager: Send + Sync {
    /// Lease a fresh channel. The caller owns it until `BrokerChannel::close`.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Release the underlying connection(s). Later `open_channel` calls fail
    /// with `BusError::Channel`.
    async fn close(&self) -> Result<()>;
}

/// A logical session with the broker.
///
/// Not safe for concurrent use by several publishers; each publish leases
/// its own.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange, failing with `BusError::Topology` on a property
    /// mismatch.
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()>;

    /// Send a message to an exchange. Returns once the broker has accepted it.
    async fn publish(&self, exchange: &str, message: &Message) -> Result<()>;

    /// Close the channel (and, for per-call connections, the connection).
    async fn close(&self) -> Result<()>;
}

/// Entry point domain handlers use to emit events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `payload` for `kind` with an explicit routing key.
    async fn publish(&self, kind: EventKind, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Publish a fully built message for `kind`.
    async fn publish_message(&self, kind: EventKind, message: Message) -> Result<()>;
}

//! Record-change notifications for CRUD handlers.
//!
//! A handler that has just written a record calls the notifier, which
//! publishes the matching catalog event. Whether a publish failure fails the
//! request is chosen per call site through `PublishPolicy`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::{BusError, EventPublisher, Message};
use crate::catalog::EventKind;

/// Content type for records serialized by `notify_json`.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// What a handler does when publishing fails after its write succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Log the failure and report success. The write stands, the
    /// notification is lost.
    #[default]
    FireAndForget,
    /// Surface the failure. The write still stands, so the caller sees an
    /// error for a change that did happen.
    Strict,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to publish {kind}: {source}")]
    Publish {
        kind: EventKind,
        #[source]
        source: BusError,
    },

    #[error("Failed to serialize {kind} payload: {source}")]
    Serialize {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Publishes record-change events on behalf of domain handlers.
#[derive(Clone)]
pub struct EventNotifier {
    publisher: Arc<dyn EventPublisher>,
    policy: PublishPolicy,
}

impl EventNotifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, policy: PublishPolicy) -> Self {
        Self { publisher, policy }
    }

    pub fn policy(&self) -> PublishPolicy {
        self.policy
    }

    /// Same publisher, different policy.
    pub fn with_policy(&self, policy: PublishPolicy) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            policy,
        }
    }

    /// Publish a pre-serialized payload.
    pub async fn notify(
        &self,
        kind: EventKind,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), NotifyError> {
        let result = self.publisher.publish(kind, routing_key, payload).await;
        self.apply(kind, result)
    }

    /// Serialize `record` as JSON and publish it.
    ///
    /// Serialization errors are returned under either policy.
    pub async fn notify_json<T>(
        &self,
        kind: EventKind,
        routing_key: &str,
        record: &T,
    ) -> Result<(), NotifyError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let body = serde_json::to_vec(record)
            .map_err(|source| NotifyError::Serialize { kind, source })?;
        let message = Message::new(routing_key, body).with_content_type(JSON_CONTENT_TYPE);

        let result = self.publisher.publish_message(kind, message).await;
        self.apply(kind, result)
    }

    fn apply(&self, kind: EventKind, result: Result<(), BusError>) -> Result<(), NotifyError> {
        match (result, self.policy) {
            (Ok(()), _) => Ok(()),
            (Err(e), PublishPolicy::FireAndForget) => {
                warn!(
                    event = %kind,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Event not published, continuing"
                );
                Ok(())
            }
            (Err(source), PublishPolicy::Strict) => Err(NotifyError::Publish { kind, source }),
        }
    }
}

//! Glue between domain handlers and the publisher.

pub mod notifier;

pub use notifier::{EventNotifier, NotifyError, PublishPolicy};

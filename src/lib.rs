//! ecom-events - event publishing core for the e-commerce services.
//!
//! Domain handlers publish record-change events (order created, product
//! updated, ...) to RabbitMQ exchanges through a `Publisher`. The publisher
//! leases one channel per call, declares the event's durable direct exchange,
//! sends once within a timeout and always releases the channel.

pub mod bus;
pub mod catalog;
pub mod config;
pub mod handlers;
pub mod utils;

pub use bus::{BusError, EventPublisher, Publisher, PublisherOptions};
pub use catalog::EventKind;

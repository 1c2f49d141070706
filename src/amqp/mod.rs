//! AMQP integration for the game finder
//!
//! Client commands are consumed from a queue and notifications are published
//! per session on a topic exchange.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{CommandConsumer, CommandHandler};
pub use messages::*;
pub use publisher::{AmqpNotifier, LogNotifier, MockNotifier, Notifier, PublisherConfig};

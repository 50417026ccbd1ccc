//! # Electricity Shop Events
//!
//! Reliable event delivery for the Electricity Shop platform:
//! - Typed domain events published to a topic exchange
//! - Per-type consumers with bounded, TTL-delayed retries
//! - Dead-letter processing into a durable, inspectable store
//! - Operator-driven requeue of permanently-failed messages
//!
//! ## Example
//!
//! ```rust,ignore
//! use electricity_shop_events::{
//!     BrokerConfig, ConnectionManager, DeadLetterProcessor, EventConsumer,
//!     EventPublisher, HandlerRegistry, MemoryBroker, MemoryFailedMessageStore,
//! };
//!
//! let registry = std::sync::Arc::new(
//!     HandlerRegistry::builder()
//!         .subscribe::<OrderPlaced, _>(SendConfirmationEmail::new(mailer))
//!         .build(),
//! );
//!
//! let connections = ConnectionManager::shared(MemoryBroker::shared(), BrokerConfig::default());
//! let consumer = EventConsumer::new(connections.clone(), registry.clone());
//! consumer.start().await?;
//!
//! let publisher = EventPublisher::new(connections);
//! publisher.publish(&OrderPlaced::new(order)).await?;
//! ```
//!
//! Delivery is at-least-once: a retried delivery re-invokes every
//! handler for the type, including ones that already succeeded on a
//! prior attempt. Handlers must be written to tolerate that.

mod config;
mod connection;
mod consumer;
mod dead_letter;
mod error;
mod event;
mod handler;
mod message;
mod publisher;
mod registry;
mod requeue;
pub mod broker;
pub mod store;
pub mod topology;

pub use broker::MemoryBroker;
pub use config::BrokerConfig;
pub use connection::ConnectionManager;
pub use consumer::EventConsumer;
pub use dead_letter::DeadLetterProcessor;
pub use error::{DeliveryError, DeliveryResult};
pub use event::DomainEvent;
pub use handler::EventHandler;
pub use message::{CONTENT_TYPE_JSON, Delivery, MessageProperties, OutgoingMessage, headers};
pub use publisher::EventPublisher;
pub use registry::{EventTypeBinding, HandlerRegistry, HandlerRegistryBuilder};
pub use requeue::RequeueService;
pub use store::{
    FailedMessage, FailedMessageQuery, FailedMessageStats, FailedMessageStore,
    MemoryFailedMessageStore, NewFailedMessage,
};

//! Broker abstraction.
//!
//! The delivery subsystem assumes a broker providing topic-exchange
//! routing, durable queues, per-message TTL, and dead-letter routing as
//! primitives. These traits capture exactly that surface; everything
//! above them (publisher, consumer, dead-letter processor, requeue) is
//! adapter-agnostic. [`MemoryBroker`] is a complete in-process
//! implementation.

mod memory;

pub use memory::MemoryBroker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::error::DeliveryResult;
use crate::message::{Delivery, OutgoingMessage};

/// Arguments a queue is declared with.
///
/// Re-declaring a queue with identical options is a no-op; re-declaring
/// with different options fails with a precondition error. Changing the
/// TTL or dead-letter arguments of an existing queue requires deleting it
/// out-of-band.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Exchange rejected or expired messages are re-published to.
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering; defaults to the message's
    /// original routing key when absent.
    pub dead_letter_routing_key: Option<String>,
    /// Per-message TTL; expiry dead-letters the message.
    pub message_ttl: Option<Duration>,
}

/// A multiplexed broker channel.
///
/// Channels are not shared across components; the publisher, each
/// per-type consumer task, and the dead-letter processor own their own.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares a durable topic exchange. Idempotent.
    async fn declare_exchange(&self, name: &str) -> DeliveryResult<()>;

    /// Declares a queue with the given options. Idempotent for identical
    /// options.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> DeliveryResult<()>;

    /// Binds a queue to an exchange on a routing-key pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> DeliveryResult<()>;

    /// Publishes a message to an exchange. Fire-and-forget: returns once
    /// the broker has accepted the message, without awaiting confirmation.
    /// An unroutable message is logged by the broker layer, not surfaced
    /// as an error.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> DeliveryResult<()>;

    /// Starts consuming from a queue. At most `prefetch` deliveries are
    /// outstanding (delivered but unacknowledged) at any time.
    async fn consume(&self, queue: &str) -> DeliveryResult<mpsc::Receiver<Delivery>>;

    /// Acknowledges a delivery by tag.
    async fn ack(&self, delivery_tag: u64) -> DeliveryResult<()>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Closes the channel; unacknowledged deliveries are returned to
    /// their queues for redelivery.
    async fn close(&self);
}

/// A long-lived broker connection handing out channels.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a fresh channel with the given prefetch count.
    async fn create_channel(&self, prefetch: u16) -> DeliveryResult<Arc<dyn Channel>>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Closes the connection and every channel created from it.
    async fn close(&self);
}

/// Dials broker connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establishes a connection using the given configuration.
    async fn connect(&self, config: &BrokerConfig) -> DeliveryResult<Arc<dyn Connection>>;
}

//! Event publisher.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::Channel;
use crate::connection::ConnectionManager;
use crate::error::DeliveryResult;
use crate::event::DomainEvent;
use crate::message::{CONTENT_TYPE_JSON, MessageProperties, OutgoingMessage, headers};
use crate::topology::routing_key;

/// Publishes typed events to the main exchange.
///
/// Publishing is fire-and-forget: the call returns once the broker has
/// accepted the message, without awaiting confirmation. Durability past
/// that point is the broker's responsibility. An unroutable message (no
/// matching queue binding) is logged by the broker layer and is not the
/// publish call's failure.
pub struct EventPublisher {
    connections: Arc<ConnectionManager>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl EventPublisher {
    /// Creates a publisher on the given connection manager.
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            channel: Mutex::new(None),
        }
    }

    /// Serializes and publishes an event.
    ///
    /// The routing key is the lowercase event type name. The envelope
    /// carries persistent delivery mode, the JSON content type, the event
    /// id as message id, the type name, and the event's logical version
    /// as a header.
    pub async fn publish<E: DomainEvent>(&self, event: &E) -> DeliveryResult<()> {
        let body = serde_json::to_vec(event)?;
        let key = routing_key(E::event_type());

        let mut properties = MessageProperties {
            message_id: Some(event.event_id().to_string()),
            type_name: Some(E::event_type().to_string()),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
            ..Default::default()
        };
        properties.set_header(headers::EVENT_VERSION, event.version().to_string());

        let channel = self.channel().await?;
        channel
            .publish(
                &self.connections.config().exchange,
                &key,
                OutgoingMessage { body, properties },
            )
            .await?;

        tracing::debug!(
            event_type = E::event_type(),
            event_id = %event.event_id(),
            routing_key = %key,
            "published event"
        );
        Ok(())
    }

    /// Returns the cached channel, lazily opening a new one if the cached
    /// one is closed. Self-healing: a closed channel is not a
    /// caller-visible error.
    async fn channel(&self) -> DeliveryResult<Arc<dyn Channel>> {
        let mut guard = self.channel.lock().await;

        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            tracing::debug!("publisher channel closed, opening a new one");
            *guard = None;
        }

        let channel = self.connections.create_channel().await?;
        *guard = Some(Arc::clone(&channel));
        Ok(channel)
    }
}

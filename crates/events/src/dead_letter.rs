//! Dead-letter processor.
//!
//! An independent background consumer draining every type's error queue
//! and persisting each poisoned message for operator inspection. The
//! error queue is a terminal sink: this component performs no retry
//! logic of its own, and a failure in its own processing is not itself
//! retried.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::Channel;
use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::error::DeliveryResult;
use crate::message::{Delivery, headers};
use crate::registry::HandlerRegistry;
use crate::store::{FailedMessageStore, NewFailedMessage};
use crate::topology::{ERROR_SUFFIX, error_queue, routing_key};

/// Drains error queues into the failed-message store.
pub struct DeadLetterProcessor {
    connections: Arc<ConnectionManager>,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn FailedMessageStore>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeadLetterProcessor {
    /// Creates a processor persisting into the given store.
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn FailedMessageStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connections,
            registry,
            store,
            channel: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts draining the error queue of every registered event type.
    /// Uses its own channel, not shared with the consumer or publisher.
    pub async fn start(&self) -> DeliveryResult<()> {
        let config = self.connections.config().clone();
        let channel = self.connections.create_channel().await?;

        let mut tasks = self.tasks.lock().await;
        for event_type in self.registry.event_types() {
            let key = routing_key(event_type);
            let deliveries = channel.consume(&error_queue(&key)).await?;

            tasks.push(tokio::spawn(drain_loop(
                Arc::clone(&channel),
                config.clone(),
                Arc::clone(&self.store),
                deliveries,
                self.shutdown.subscribe(),
            )));
        }
        *self.channel.lock().await = Some(channel);

        tracing::info!("dead-letter processor started");
        Ok(())
    }

    /// Stops draining and closes the channel.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
        }
        tracing::info!("dead-letter processor stopped");
    }
}

async fn drain_loop(
    channel: Arc<dyn Channel>,
    config: BrokerConfig,
    store: Arc<dyn FailedMessageStore>,
    mut deliveries: tokio::sync::mpsc::Receiver<Delivery>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => {
                    process_dead_letter(channel.as_ref(), &config, store.as_ref(), delivery)
                        .await;
                }
                None => break,
            }
        }
    }
}

async fn process_dead_letter(
    channel: &dyn Channel,
    config: &BrokerConfig,
    store: &dyn FailedMessageStore,
    delivery: Delivery,
) {
    let delivery_tag = delivery.delivery_tag;
    let failure = extract_failure(&delivery, config);

    match store.log_failed_message(failure).await {
        Ok(record) => {
            tracing::warn!(
                record_id = %record.id,
                message_id = %record.message_id,
                event_type = %record.event_type,
                error = %record.error,
                "dead-lettered message persisted"
            );
            if let Err(err) = channel.ack(delivery_tag).await {
                tracing::error!(delivery_tag, error = %err, "failed to acknowledge dead letter");
            }
        }
        Err(err) => {
            // Fatal for this delivery: leave it unacked so the broker
            // redelivers it once the store recovers.
            tracing::error!(
                delivery_tag,
                error = %err,
                "failed to persist dead-lettered message, leaving it unacknowledged"
            );
        }
    }
}

/// Extracts the failed-message fields from an error-queue delivery,
/// applying the documented defaults for absent headers.
fn extract_failure(delivery: &Delivery, config: &BrokerConfig) -> NewFailedMessage {
    let properties = &delivery.properties;

    let message_id = properties
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let event_type = properties
        .type_name
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let exchange = properties
        .header(headers::ORIGINAL_EXCHANGE)
        .unwrap_or(&config.exchange)
        .to_string();
    let routing_key = properties
        .header(headers::ORIGINAL_ROUTING_KEY)
        .map(str::to_string)
        .unwrap_or_else(|| {
            delivery
                .routing_key
                .strip_suffix(&format!(".{ERROR_SUFFIX}"))
                .unwrap_or(&delivery.routing_key)
                .to_string()
        });
    let error = properties
        .header(headers::LAST_ERROR)
        .unwrap_or("Unknown error")
        .to_string();

    NewFailedMessage {
        message_id,
        event_type,
        exchange,
        routing_key,
        body: delivery.body.clone(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageProperties;

    fn error_delivery(properties: MessageProperties) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "dead-letter".to_string(),
            routing_key: "orderplaced.error".to_string(),
            redelivered: false,
            body: b"{\"id\":1}".to_vec(),
            properties,
        }
    }

    #[test]
    fn test_extract_with_headers() {
        let mut properties = MessageProperties {
            message_id: Some("m-1".to_string()),
            type_name: Some("OrderPlaced".to_string()),
            ..Default::default()
        };
        properties.set_header(headers::ORIGINAL_EXCHANGE, "main");
        properties.set_header(headers::ORIGINAL_ROUTING_KEY, "orderplaced");
        properties.set_header(headers::LAST_ERROR, "handler blew up");

        let failure = extract_failure(&error_delivery(properties), &BrokerConfig::default());
        assert_eq!(failure.message_id, "m-1");
        assert_eq!(failure.event_type, "OrderPlaced");
        assert_eq!(failure.exchange, "main");
        assert_eq!(failure.routing_key, "orderplaced");
        assert_eq!(failure.error, "handler blew up");
    }

    #[test]
    fn test_extract_defaults_for_absent_headers() {
        let properties = MessageProperties::default();
        let failure = extract_failure(&error_delivery(properties), &BrokerConfig::default());

        assert!(!failure.message_id.is_empty());
        assert_eq!(failure.event_type, "unknown");
        assert_eq!(failure.exchange, "main");
        // Routing key falls back to the delivery key with `.error` stripped.
        assert_eq!(failure.routing_key, "orderplaced");
        assert_eq!(failure.error, "Unknown error");
    }
}

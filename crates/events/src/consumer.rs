//! Consumer and retry-routing engine.
//!
//! One long-lived task and one channel per registered event type; within
//! a delivery, handlers run sequentially and the first failure decides
//! the message's fate:
//!
//! - unknown type or no handlers: straight to the error queue, no
//!   retries (retrying cannot create a missing handler);
//! - handler failure with retries left: to the retry queue with an
//!   incremented counter; the retry queue's TTL sends it back to the
//!   main queue after the configured interval;
//! - retries exhausted: to the error queue.
//!
//! The original delivery is acknowledged exactly once, after its fate is
//! decided. If routing to the retry or error queue fails, the delivery
//! is left unacknowledged so the broker redelivers it: a crash
//! mid-decision can duplicate a delivery, never lose one.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::broker::Channel;
use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{Delivery, OutgoingMessage, headers};
use crate::registry::HandlerRegistry;
use crate::topology::{
    declare_event_topology, error_routing_key, main_queue, retry_routing_key, routing_key,
};

/// Consumes main queues and routes failures to retry or error queues.
pub struct EventConsumer {
    connections: Arc<ConnectionManager>,
    registry: Arc<HandlerRegistry>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventConsumer {
    /// Creates a consumer over the given registry.
    pub fn new(connections: Arc<ConnectionManager>, registry: Arc<HandlerRegistry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connections,
            registry,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Declares topology and begins consuming for every event type in the
    /// registry. Types registered after this point are not picked up
    /// without a restart.
    pub async fn start(&self) -> DeliveryResult<()> {
        let config = self.connections.config().clone();
        let event_types: Vec<String> =
            self.registry.event_types().map(str::to_string).collect();

        let setup = self.connections.create_channel().await?;
        for event_type in &event_types {
            declare_event_topology(setup.as_ref(), &config, event_type).await?;
        }
        setup.close().await;

        let mut tasks = self.tasks.lock().await;
        for event_type in &event_types {
            let key = routing_key(event_type);
            let channel = self.connections.create_channel().await?;
            let deliveries = channel.consume(&main_queue(&key)).await?;

            tasks.push(tokio::spawn(consume_loop(
                channel,
                config.clone(),
                Arc::clone(&self.registry),
                deliveries,
                self.shutdown.subscribe(),
                event_type.clone(),
            )));
        }

        tracing::info!(event_types = event_types.len(), "event consumer started");
        Ok(())
    }

    /// Signals every consume loop to stop and waits for them to drain.
    /// In-flight handler invocations complete; they are not interrupted.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("event consumer stopped");
    }
}

async fn consume_loop(
    channel: Arc<dyn Channel>,
    config: BrokerConfig,
    registry: Arc<HandlerRegistry>,
    mut deliveries: tokio::sync::mpsc::Receiver<Delivery>,
    mut stop: watch::Receiver<bool>,
    event_type: String,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => {
                    process_delivery(channel.as_ref(), &config, &registry, delivery).await;
                }
                None => break,
            }
        }
    }
    channel.close().await;
    tracing::debug!(%event_type, "consume loop stopped");
}

enum Fate {
    Ack,
    Retry { next_count: u32, error: String },
    Error { error: String },
}

async fn process_delivery(
    channel: &dyn Channel,
    config: &BrokerConfig,
    registry: &HandlerRegistry,
    delivery: Delivery,
) {
    let type_name = delivery.properties.type_name.clone().unwrap_or_default();

    let fate = match registry
        .binding(&type_name)
        .filter(|binding| binding.handler_count() > 0)
    {
        None => {
            tracing::warn!(
                event_type = %type_name,
                routing_key = %delivery.routing_key,
                "no handler registered, routing to error queue"
            );
            Fate::Error {
                error: format!("No handler registered for event type '{type_name}'"),
            }
        }
        Some(binding) => {
            let mut failure = None;
            for handler in binding.handlers() {
                if let Err(err) = handler.invoke(&delivery.body).await {
                    tracing::warn!(
                        handler = handler.id(),
                        event_type = %type_name,
                        error = %err,
                        "handler failed"
                    );
                    failure = Some(err);
                    break;
                }
            }

            match failure {
                None => Fate::Ack,
                // A malformed body is terminal: retrying cannot fix it.
                Some(err @ DeliveryError::Serialization(_)) => {
                    Fate::Error { error: err.to_string() }
                }
                Some(err) => {
                    let attempts = delivery.properties.retry_count();
                    if attempts < config.max_retries {
                        Fate::Retry {
                            next_count: attempts + 1,
                            error: err.to_string(),
                        }
                    } else {
                        Fate::Error { error: err.to_string() }
                    }
                }
            }
        }
    };

    let routed = match &fate {
        Fate::Ack => true,
        Fate::Retry { next_count, error } => {
            route_failed(
                channel,
                config,
                &delivery,
                &retry_routing_key(&delivery.routing_key),
                error,
                Some(*next_count),
            )
            .await
        }
        Fate::Error { error } => {
            route_failed(
                channel,
                config,
                &delivery,
                &error_routing_key(&delivery.routing_key),
                error,
                None,
            )
            .await
        }
    };

    if routed {
        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            tracing::error!(
                event_type = %type_name,
                delivery_tag = delivery.delivery_tag,
                error = %err,
                "failed to acknowledge delivery"
            );
        }
    }
}

async fn route_failed(
    channel: &dyn Channel,
    config: &BrokerConfig,
    delivery: &Delivery,
    routing_key: &str,
    error: &str,
    retry_count: Option<u32>,
) -> bool {
    let message = stamped(delivery, error, retry_count);
    match channel
        .publish(&config.dead_letter_exchange, routing_key, message)
        .await
    {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(
                routing_key,
                error = %err,
                "failed to route message, leaving it unacknowledged for redelivery"
            );
            false
        }
    }
}

/// Copies the original headers and content type, then stamps the updated
/// retry count, last error, the message's original exchange and routing
/// key (needed by requeue later), and the failure timestamp.
fn stamped(delivery: &Delivery, error: &str, retry_count: Option<u32>) -> OutgoingMessage {
    let mut properties = delivery.properties.clone();
    properties.persistent = true;
    if let Some(count) = retry_count {
        properties.set_header(headers::RETRY_COUNT, count.to_string());
    }
    properties.set_header(headers::LAST_ERROR, error);
    properties.set_header(headers::ORIGINAL_EXCHANGE, &delivery.exchange);
    properties.set_header(headers::ORIGINAL_ROUTING_KEY, &delivery.routing_key);
    properties.set_header(headers::FAILED_AT, Utc::now().to_rfc3339());
    OutgoingMessage {
        body: delivery.body.clone(),
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageProperties;

    fn delivery() -> Delivery {
        let mut properties = MessageProperties {
            message_id: Some("m-1".to_string()),
            type_name: Some("OrderPlaced".to_string()),
            content_type: Some("application/json".to_string()),
            persistent: true,
            ..Default::default()
        };
        properties.set_header(headers::EVENT_VERSION, "2");
        Delivery {
            delivery_tag: 1,
            exchange: "main".to_string(),
            routing_key: "orderplaced".to_string(),
            redelivered: false,
            body: b"{}".to_vec(),
            properties,
        }
    }

    #[test]
    fn test_stamped_preserves_and_adds_headers() {
        let message = stamped(&delivery(), "boom", Some(2));

        let properties = &message.properties;
        assert!(properties.persistent);
        assert_eq!(properties.header(headers::EVENT_VERSION), Some("2"));
        assert_eq!(properties.header(headers::RETRY_COUNT), Some("2"));
        assert_eq!(properties.header(headers::LAST_ERROR), Some("boom"));
        assert_eq!(properties.header(headers::ORIGINAL_EXCHANGE), Some("main"));
        assert_eq!(
            properties.header(headers::ORIGINAL_ROUTING_KEY),
            Some("orderplaced")
        );
        assert!(properties.header(headers::FAILED_AT).is_some());
    }

    #[test]
    fn test_stamped_error_path_keeps_existing_count() {
        let mut input = delivery();
        input.properties.set_header(headers::RETRY_COUNT, "3");

        let message = stamped(&input, "final failure", None);
        assert_eq!(message.properties.header(headers::RETRY_COUNT), Some("3"));
        assert_eq!(message.properties.retry_count(), 3);
    }
}

//! Per-event-type queue topology.
//!
//! Every event type `T` with routing key `t = lowercase(T)` gets three
//! durable queues:
//!
//! - `electricity_shop.t`: the main queue, bound to the main exchange on
//!   `t`; dead-letters to the dead-letter exchange on `t.error`.
//! - `electricity_shop.t.retry`: bound to the dead-letter exchange on
//!   `t.retry`; holds messages for the retry interval (message TTL), then
//!   dead-letters them back onto the main exchange on `t`. TTL expiry is
//!   the delay mechanism; there is no scheduler.
//! - `electricity_shop.t.error`: terminal, bound to the dead-letter
//!   exchange on `t.error`.

use crate::broker::{Channel, QueueOptions};
use crate::config::BrokerConfig;
use crate::error::DeliveryResult;

/// Prefix for every queue owned by this subsystem.
pub const QUEUE_PREFIX: &str = "electricity_shop";

/// Suffix of the retry routing key and queue.
const RETRY_SUFFIX: &str = "retry";

/// Suffix of the error routing key and queue.
pub(crate) const ERROR_SUFFIX: &str = "error";

/// Routing key for an event type: its lowercase name.
pub fn routing_key(event_type: &str) -> String {
    event_type.to_lowercase()
}

/// Routing key for the retry path of a type.
pub fn retry_routing_key(key: &str) -> String {
    format!("{key}.{RETRY_SUFFIX}")
}

/// Routing key for the error path of a type.
pub fn error_routing_key(key: &str) -> String {
    format!("{key}.{ERROR_SUFFIX}")
}

/// Name of the main queue for a routing key.
pub fn main_queue(key: &str) -> String {
    format!("{QUEUE_PREFIX}.{key}")
}

/// Name of the retry queue for a routing key.
pub fn retry_queue(key: &str) -> String {
    format!("{QUEUE_PREFIX}.{key}.{RETRY_SUFFIX}")
}

/// Name of the error queue for a routing key.
pub fn error_queue(key: &str) -> String {
    format!("{QUEUE_PREFIX}.{key}.{ERROR_SUFFIX}")
}

/// Declares the exchanges, queues, and bindings for one event type.
///
/// Declaration is idempotent: running it again with the same
/// configuration is safe. Changing the retry interval or routing
/// arguments of existing queues requires deleting them out-of-band.
pub async fn declare_event_topology(
    channel: &dyn Channel,
    config: &BrokerConfig,
    event_type: &str,
) -> DeliveryResult<()> {
    let key = routing_key(event_type);

    channel.declare_exchange(&config.exchange).await?;
    channel.declare_exchange(&config.dead_letter_exchange).await?;

    channel
        .declare_queue(
            &main_queue(&key),
            QueueOptions {
                durable: true,
                dead_letter_exchange: Some(config.dead_letter_exchange.clone()),
                dead_letter_routing_key: Some(error_routing_key(&key)),
                message_ttl: None,
            },
        )
        .await?;
    channel
        .bind_queue(&main_queue(&key), &config.exchange, &key)
        .await?;

    channel
        .declare_queue(
            &retry_queue(&key),
            QueueOptions {
                durable: true,
                dead_letter_exchange: Some(config.exchange.clone()),
                dead_letter_routing_key: Some(key.clone()),
                message_ttl: Some(config.retry_interval),
            },
        )
        .await?;
    channel
        .bind_queue(
            &retry_queue(&key),
            &config.dead_letter_exchange,
            &retry_routing_key(&key),
        )
        .await?;

    channel
        .declare_queue(
            &error_queue(&key),
            QueueOptions { durable: true, ..Default::default() },
        )
        .await?;
    channel
        .bind_queue(
            &error_queue(&key),
            &config.dead_letter_exchange,
            &error_routing_key(&key),
        )
        .await?;

    tracing::debug!(event_type, %key, "declared delivery topology");
    Ok(())
}

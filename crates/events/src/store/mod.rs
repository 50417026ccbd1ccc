//! Failed-message store.
//!
//! Durable log of permanently-failed messages. Records are created by the
//! dead-letter processor, flipped to `processed` by a successful requeue,
//! and never deleted automatically.

mod memory;

pub use memory::MemoryFailedMessageStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryResult;

/// A delivery that reached the error queue, persisted for inspection and
/// replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    /// Record id.
    pub id: String,
    /// Message id of the failed delivery (the event id, when present).
    pub message_id: String,
    /// Event type name.
    pub event_type: String,
    /// Exchange the message was originally published to.
    pub exchange: String,
    /// Routing key the message was originally published with.
    pub routing_key: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Error text from the last failed attempt.
    pub error: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
    /// Set true only after a successful requeue.
    pub processed: bool,
}

/// Input for logging a new failed message.
#[derive(Debug, Clone)]
pub struct NewFailedMessage {
    /// Message id of the failed delivery.
    pub message_id: String,
    /// Event type name.
    pub event_type: String,
    /// Original exchange.
    pub exchange: String,
    /// Original routing key.
    pub routing_key: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Error text.
    pub error: String,
}

/// Query parameters for listing failed messages.
#[derive(Debug, Clone, Default)]
pub struct FailedMessageQuery {
    /// Filter by event type.
    pub event_type: Option<String>,
    /// Include records already marked processed.
    pub include_processed: bool,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: Option<usize>,
}

/// Summary statistics over the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessageStats {
    /// Total number of records.
    pub total: usize,
    /// Records not yet requeued.
    pub unprocessed: usize,
    /// Record counts per event type.
    pub by_event_type: HashMap<String, usize>,
}

/// Storage trait for failed messages.
#[async_trait]
pub trait FailedMessageStore: Send + Sync {
    /// Persists a new record. A persistence failure propagates: there is
    /// no secondary fallback.
    async fn log_failed_message(&self, failure: NewFailedMessage)
    -> DeliveryResult<FailedMessage>;

    /// Returns a record by id, or `None`.
    async fn get_failed_message(&self, id: &str) -> DeliveryResult<Option<FailedMessage>>;

    /// Lists records matching the query, newest first.
    async fn list(&self, query: &FailedMessageQuery) -> DeliveryResult<Vec<FailedMessage>>;

    /// Marks a record processed. Fails with not-found if absent.
    async fn mark_processed(&self, id: &str) -> DeliveryResult<()>;

    /// Returns summary statistics.
    async fn stats(&self) -> DeliveryResult<FailedMessageStats>;
}

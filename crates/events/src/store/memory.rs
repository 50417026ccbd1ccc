//! In-memory failed-message store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DeliveryError, DeliveryResult};
use crate::store::{
    FailedMessage, FailedMessageQuery, FailedMessageStats, FailedMessageStore, NewFailedMessage,
};

/// In-memory [`FailedMessageStore`] implementation.
pub struct MemoryFailedMessageStore {
    records: RwLock<Vec<FailedMessage>>,
}

impl MemoryFailedMessageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Creates a shared store.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for MemoryFailedMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailedMessageStore for MemoryFailedMessageStore {
    async fn log_failed_message(
        &self,
        failure: NewFailedMessage,
    ) -> DeliveryResult<FailedMessage> {
        let record = FailedMessage {
            id: Uuid::new_v4().to_string(),
            message_id: failure.message_id,
            event_type: failure.event_type,
            exchange: failure.exchange,
            routing_key: failure.routing_key,
            body: failure.body,
            error: failure.error,
            failed_at: Utc::now(),
            processed: false,
        };
        let mut records = self.records.write().await;
        records.push(record.clone());
        Ok(record)
    }

    async fn get_failed_message(&self, id: &str) -> DeliveryResult<Option<FailedMessage>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, query: &FailedMessageQuery) -> DeliveryResult<Vec<FailedMessage>> {
        let records = self.records.read().await;

        let mut matching: Vec<FailedMessage> = records
            .iter()
            .rev()
            .filter(|r| {
                if let Some(ref event_type) = query.event_type {
                    if &r.event_type != event_type {
                        return false;
                    }
                }
                query.include_processed || !r.processed
            })
            .cloned()
            .collect();

        if let Some(offset) = query.offset {
            matching = matching.into_iter().skip(offset).collect();
        }
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }

        Ok(matching)
    }

    async fn mark_processed(&self, id: &str) -> DeliveryResult<()> {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.processed = true;
                Ok(())
            }
            None => Err(DeliveryError::NotFound(id.to_string())),
        }
    }

    async fn stats(&self) -> DeliveryResult<FailedMessageStats> {
        let records = self.records.read().await;

        let mut by_event_type = HashMap::new();
        let mut unprocessed = 0;
        for record in records.iter() {
            *by_event_type.entry(record.event_type.clone()).or_insert(0) += 1;
            if !record.processed {
                unprocessed += 1;
            }
        }

        Ok(FailedMessageStats {
            total: records.len(),
            unprocessed,
            by_event_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(event_type: &str) -> NewFailedMessage {
        NewFailedMessage {
            message_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            exchange: "main".to_string(),
            routing_key: event_type.to_lowercase(),
            body: b"{}".to_vec(),
            error: "Test error".to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_and_get() {
        let store = MemoryFailedMessageStore::new();
        let record = store.log_failed_message(failure("OrderPlaced")).await.unwrap();
        assert!(!record.processed);

        let fetched = store.get_failed_message(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.event_type, "OrderPlaced");
        assert_eq!(fetched.error, "Test error");
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MemoryFailedMessageStore::new();
        assert!(store.get_failed_message("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_type_and_processed() {
        let store = MemoryFailedMessageStore::new();
        let first = store.log_failed_message(failure("OrderPlaced")).await.unwrap();
        store.log_failed_message(failure("OrderPlaced")).await.unwrap();
        store.log_failed_message(failure("MeterRead")).await.unwrap();

        let query = FailedMessageQuery {
            event_type: Some("OrderPlaced".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list(&query).await.unwrap().len(), 2);

        store.mark_processed(&first.id).await.unwrap();
        assert_eq!(store.list(&query).await.unwrap().len(), 1);

        let with_processed = FailedMessageQuery {
            event_type: Some("OrderPlaced".to_string()),
            include_processed: true,
            ..Default::default()
        };
        assert_eq!(store.list(&with_processed).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_processed_missing_is_not_found() {
        let store = MemoryFailedMessageStore::new();
        let err = store.mark_processed("nope").await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stats() {
        let store = MemoryFailedMessageStore::new();
        let record = store.log_failed_message(failure("OrderPlaced")).await.unwrap();
        store.log_failed_message(failure("MeterRead")).await.unwrap();
        store.mark_processed(&record.id).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unprocessed, 1);
        assert_eq!(stats.by_event_type.get("OrderPlaced"), Some(&1));
    }
}

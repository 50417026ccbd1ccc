//! Operator API: inspect and requeue failed messages.

use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{CONTENT_TYPE_JSON, MessageProperties, OutgoingMessage};
use crate::store::{FailedMessage, FailedMessageStore};

/// Re-publishes stored failed messages back onto their original
/// exchange and routing key.
///
/// An HTTP collaborator maps [`DeliveryError::NotFound`] to 404 and a
/// successful requeue to 204.
pub struct RequeueService {
    store: Arc<dyn FailedMessageStore>,
    connections: Arc<ConnectionManager>,
}

impl RequeueService {
    /// Creates a requeue service over the given store.
    pub fn new(store: Arc<dyn FailedMessageStore>, connections: Arc<ConnectionManager>) -> Self {
        Self { store, connections }
    }

    /// Returns a failed-message record, or `None`.
    pub async fn get_failed_message(&self, id: &str) -> DeliveryResult<Option<FailedMessage>> {
        self.store.get_failed_message(id).await
    }

    /// Re-publishes the stored raw body to the record's original exchange
    /// and routing key, then marks the record processed.
    ///
    /// Fails with [`DeliveryError::NotFound`] if no record exists. Any
    /// failure during the republish itself is caught, logged, and
    /// reported as `Ok(false)` with the record left unprocessed, so the
    /// operator can safely retry.
    pub async fn requeue_failed_message(&self, id: &str) -> DeliveryResult<bool> {
        let record = self
            .store
            .get_failed_message(id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound(id.to_string()))?;

        if let Err(err) = self.republish(&record).await {
            tracing::error!(
                record_id = %record.id,
                message_id = %record.message_id,
                error = %err,
                "failed to requeue message"
            );
            return Ok(false);
        }

        self.store.mark_processed(id).await?;
        tracing::info!(
            record_id = %record.id,
            message_id = %record.message_id,
            exchange = %record.exchange,
            routing_key = %record.routing_key,
            "requeued failed message"
        );
        Ok(true)
    }

    async fn republish(&self, record: &FailedMessage) -> DeliveryResult<()> {
        let channel = self.connections.create_channel().await?;

        let properties = MessageProperties {
            message_id: Some(record.message_id.clone()),
            type_name: Some(record.event_type.clone()),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
            ..Default::default()
        };
        let result = channel
            .publish(
                &record.exchange,
                &record.routing_key,
                OutgoingMessage {
                    body: record.body.clone(),
                    properties,
                },
            )
            .await;
        channel.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Connection, MemoryBroker, QueueOptions};
    use crate::config::BrokerConfig;
    use crate::store::{MemoryFailedMessageStore, NewFailedMessage};
    use async_trait::async_trait;

    struct UnreachableBroker;

    #[async_trait]
    impl Broker for UnreachableBroker {
        async fn connect(&self, _config: &BrokerConfig) -> DeliveryResult<Arc<dyn Connection>> {
            Err(DeliveryError::Connection("connection refused".to_string()))
        }
    }

    fn failure() -> NewFailedMessage {
        NewFailedMessage {
            message_id: "m-1".to_string(),
            event_type: "OrderPlaced".to_string(),
            exchange: "main".to_string(),
            routing_key: "orderplaced".to_string(),
            body: b"{\"total\":5}".to_vec(),
            error: "handler failed".to_string(),
        }
    }

    #[tokio::test]
    async fn test_requeue_missing_record_is_not_found() {
        let service = RequeueService::new(
            MemoryFailedMessageStore::shared(),
            ConnectionManager::shared(MemoryBroker::shared(), BrokerConfig::default()),
        );

        let err = service.requeue_failed_message("nope").await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_requeue_republishes_and_marks_processed() {
        let broker = MemoryBroker::shared();
        let config = BrokerConfig::default();
        let store = MemoryFailedMessageStore::shared();
        let record = store.log_failed_message(failure()).await.unwrap();

        // Probe queue observing the original exchange/routing key.
        let probe = broker.connect(&config).await.unwrap();
        let probe_channel = probe.create_channel(1).await.unwrap();
        probe_channel.declare_exchange("main").await.unwrap();
        probe_channel
            .declare_queue("probe", QueueOptions { durable: true, ..Default::default() })
            .await
            .unwrap();
        probe_channel
            .bind_queue("probe", "main", "orderplaced")
            .await
            .unwrap();

        let service = RequeueService::new(
            store.clone(),
            ConnectionManager::shared(broker.clone(), config),
        );
        let requeued = service.requeue_failed_message(&record.id).await.unwrap();
        assert!(requeued);

        let mut deliveries = probe_channel.consume("probe").await.unwrap();
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.body, b"{\"total\":5}");
        assert_eq!(delivery.properties.message_id, Some("m-1".to_string()));
        assert_eq!(delivery.properties.type_name, Some("OrderPlaced".to_string()));
        assert!(delivery.properties.persistent);
        probe_channel.ack(delivery.delivery_tag).await.unwrap();

        let stored = service.get_failed_message(&record.id).await.unwrap().unwrap();
        assert!(stored.processed);

        // Requeueing again still reports success; no data corruption.
        assert!(service.requeue_failed_message(&record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_republish_failure_is_a_soft_false() {
        let store = MemoryFailedMessageStore::shared();
        let record = store.log_failed_message(failure()).await.unwrap();

        let service = RequeueService::new(
            store.clone(),
            ConnectionManager::shared(Arc::new(UnreachableBroker), BrokerConfig::default()),
        );

        let requeued = service.requeue_failed_message(&record.id).await.unwrap();
        assert!(!requeued);

        // Record remains unprocessed, safe to retry.
        let stored = service.get_failed_message(&record.id).await.unwrap().unwrap();
        assert!(!stored.processed);
    }
}

//! End-to-end delivery scenarios: publish, consume, retry routing,
//! dead-lettering, and operator requeue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use electricity_shop_events::{
    BrokerConfig, ConnectionManager, DeadLetterProcessor, DeliveryError, DeliveryResult,
    DomainEvent, EventConsumer, EventHandler, EventPublisher, FailedMessage, FailedMessageQuery,
    FailedMessageStore, HandlerRegistry, MemoryBroker, MemoryFailedMessageStore, RequeueService,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    id: Uuid,
    version: u64,
    order_number: String,
}

impl OrderPlaced {
    fn new(order_number: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            order_number: order_number.to_string(),
        }
    }
}

impl DomainEvent for OrderPlaced {
    fn event_type() -> &'static str {
        "OrderPlaced"
    }

    fn event_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderShipped {
    id: Uuid,
    version: u64,
}

impl DomainEvent for OrderShipped {
    fn event_type() -> &'static str {
        "OrderShipped"
    }

    fn event_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Fails the first `fail_first` attempts, succeeds afterwards.
struct FlakyHandler {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

impl FlakyHandler {
    fn new(calls: Arc<AtomicU32>, fail_first: u32) -> Self {
        Self { calls, fail_first }
    }
}

#[async_trait]
impl EventHandler<OrderPlaced> for FlakyHandler {
    fn id(&self) -> &str {
        "flaky"
    }

    async fn handle(&self, _event: OrderPlaced) -> DeliveryResult<()> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            Err(DeliveryError::HandlerFailed {
                handler: "flaky".to_string(),
                message: format!("attempt {attempt} failed"),
            })
        } else {
            Ok(())
        }
    }
}

struct Stack {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryFailedMessageStore>,
    publisher: EventPublisher,
    consumer: EventConsumer,
    processor: DeadLetterProcessor,
}

async fn start_stack(max_retries: u32, registry: Arc<HandlerRegistry>) -> Stack {
    let broker = MemoryBroker::shared();
    let config = BrokerConfig::default()
        .with_max_retries(max_retries)
        .with_retry_interval(Duration::from_millis(50));
    let connections = ConnectionManager::shared(broker.clone(), config);
    let store = MemoryFailedMessageStore::shared();

    let consumer = EventConsumer::new(connections.clone(), registry.clone());
    consumer.start().await.unwrap();
    let processor = DeadLetterProcessor::new(connections.clone(), registry, store.clone());
    processor.start().await.unwrap();

    Stack {
        broker,
        store,
        publisher: EventPublisher::new(connections),
        consumer,
        processor,
    }
}

async fn first_record(
    store: &MemoryFailedMessageStore,
    timeout: Duration,
) -> Option<FailedMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        let records = store
            .list(&FailedMessageQuery { include_processed: true, ..Default::default() })
            .await
            .unwrap();
        if let Some(record) = records.first() {
            return Some(record.clone());
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_calls(calls: &AtomicU32, expected: u32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while calls.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "timed out waiting for handler calls");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_successful_handling_acks_once_and_stores_nothing() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = Arc::new(
        HandlerRegistry::builder()
            .subscribe::<OrderPlaced, _>(FlakyHandler::new(calls.clone(), 0))
            .build(),
    );
    let stack = start_stack(3, registry).await;

    stack.publisher.publish(&OrderPlaced::new("ORD-1")).await.unwrap();

    wait_for_calls(&calls, 1, Duration::from_secs(5)).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(stack.store.stats().await.unwrap().total, 0);
    assert_eq!(
        stack.broker.queue_depth("electricity_shop.orderplaced").await,
        Some(0)
    );
}

#[tokio::test]
async fn test_poison_message_is_retried_then_dead_lettered() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = Arc::new(
        HandlerRegistry::builder()
            .subscribe::<OrderPlaced, _>(FlakyHandler::new(calls.clone(), u32::MAX))
            .build(),
    );
    let stack = start_stack(2, registry).await;

    let event = OrderPlaced::new("ORD-2");
    stack.publisher.publish(&event).await.unwrap();

    // 1 initial attempt + 2 retries, then exactly one record.
    let record = first_record(&stack.store, Duration::from_secs(5)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!record.processed);
    assert_eq!(record.event_type, "OrderPlaced");
    assert_eq!(record.message_id, event.id.to_string());
    assert_eq!(record.exchange, "main");
    assert_eq!(record.routing_key, "orderplaced");
    assert!(record.error.contains("failed"));

    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(stack.store.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn test_event_type_without_handler_goes_straight_to_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = Arc::new(
        HandlerRegistry::builder()
            .subscribe::<OrderPlaced, _>(FlakyHandler::new(calls.clone(), 0))
            // Registered so its topology exists, but no handler subscribed.
            .register_event_type::<OrderShipped>()
            .build(),
    );
    let stack = start_stack(3, registry).await;

    let event = OrderShipped { id: Uuid::new_v4(), version: 1 };
    stack.publisher.publish(&event).await.unwrap();

    let record = first_record(&stack.store, Duration::from_secs(5)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(record.event_type, "OrderShipped");
    assert!(record.error.contains("No handler registered"));
    assert!(!record.processed);
    assert_eq!(stack.store.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn test_handler_recovering_within_retry_budget_leaves_no_record() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = Arc::new(
        HandlerRegistry::builder()
            // First two attempts throw, third succeeds.
            .subscribe::<OrderPlaced, _>(FlakyHandler::new(calls.clone(), 2))
            .build(),
    );
    let stack = start_stack(3, registry).await;

    stack.publisher.publish(&OrderPlaced::new("ORD-3")).await.unwrap();

    wait_for_calls(&calls, 3, Duration::from_secs(5)).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(stack.store.stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_requeued_message_flows_through_delivery_again() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = Arc::new(
        HandlerRegistry::builder()
            // Fails the first two attempts; with max_retries = 1 that
            // exhausts the retry budget and dead-letters the message.
            .subscribe::<OrderPlaced, _>(FlakyHandler::new(calls.clone(), 2))
            .build(),
    );
    let stack = start_stack(1, registry).await;

    let broker = stack.broker.clone();
    let connections = ConnectionManager::shared(
        broker,
        BrokerConfig::default().with_retry_interval(Duration::from_millis(50)),
    );
    let requeue = RequeueService::new(stack.store.clone(), connections);

    stack.publisher.publish(&OrderPlaced::new("ORD-4")).await.unwrap();

    let record = first_record(&stack.store, Duration::from_secs(5)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!record.processed);

    // Operator requeues: the republished message succeeds on its third
    // handler invocation and the record flips to processed.
    assert!(requeue.requeue_failed_message(&record.id).await.unwrap());

    wait_for_calls(&calls, 3, Duration::from_secs(5)).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stored = stack
        .store
        .get_failed_message(&record.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.processed);
    let stats = stack.store.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.unprocessed, 0);
}

#[tokio::test]
async fn test_graceful_shutdown_stops_consumers() {
    let registry = Arc::new(
        HandlerRegistry::builder()
            .subscribe::<OrderPlaced, _>(FlakyHandler::new(Arc::new(AtomicU32::new(0)), 0))
            .build(),
    );
    let stack = start_stack(3, registry).await;

    stack.consumer.stop().await;
    stack.processor.stop().await;
}

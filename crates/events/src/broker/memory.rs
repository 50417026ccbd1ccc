//! In-process broker implementation.
//!
//! Implements the primitives the delivery subsystem relies on: topic
//! exchanges with `*`/`#` pattern bindings, queues with dead-letter
//! arguments and per-message TTL, per-channel prefetch, and explicit
//! acknowledgement with redelivery of unacked messages on channel close.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc, watch};

use crate::broker::{Broker, Channel, Connection, QueueOptions};
use crate::config::BrokerConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{Delivery, MessageProperties, OutgoingMessage};

struct QueuedMessage {
    seq: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    body: Vec<u8>,
    properties: MessageProperties,
}

struct QueueState {
    options: QueueOptions,
    messages: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
}

struct ExchangeState {
    bindings: Vec<(String, String)>, // (pattern, queue)
}

#[derive(Default)]
struct BrokerInner {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

struct BrokerCore {
    inner: Mutex<BrokerInner>,
    next_seq: AtomicU64,
    next_tag: AtomicU64,
}

/// Routes a message through an exchange into every queue whose binding
/// pattern matches the routing key. Messages entering a queue with a TTL
/// get an expiry task that dead-letters them if still unconsumed.
async fn route(
    core: &Arc<BrokerCore>,
    exchange: &str,
    routing_key: &str,
    message: OutgoingMessage,
) -> DeliveryResult<()> {
    let mut inner = core.inner.lock().await;

    let Some(ex) = inner.exchanges.get(exchange) else {
        return Err(DeliveryError::PreconditionFailed(format!(
            "exchange '{exchange}' is not declared"
        )));
    };

    let targets: Vec<String> = ex
        .bindings
        .iter()
        .filter(|(pattern, _)| topic_match(pattern, routing_key))
        .map(|(_, queue)| queue.clone())
        .collect();

    if targets.is_empty() {
        tracing::warn!(exchange, routing_key, "unroutable message returned, dropping");
        return Ok(());
    }

    for name in targets {
        if let Some(queue) = inner.queues.get_mut(&name) {
            let seq = core.next_seq.fetch_add(1, Ordering::Relaxed);
            queue.messages.push_back(QueuedMessage {
                seq,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                body: message.body.clone(),
                properties: message.properties.clone(),
            });
            queue.notify.notify_one();

            if let Some(ttl) = queue.options.message_ttl {
                tokio::spawn(expire(Arc::clone(core), name.clone(), seq, ttl));
            }
        }
    }

    Ok(())
}

/// Dead-letters a message out of a queue once its TTL elapses, if it has
/// not been consumed by then. Boxed so the expiry → route → expiry cycle
/// does not form an infinitely sized future type.
fn expire(
    core: Arc<BrokerCore>,
    queue_name: String,
    seq: u64,
    ttl: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tokio::time::sleep(ttl).await;

        let expired = {
            let mut inner = core.inner.lock().await;
            let Some(queue) = inner.queues.get_mut(&queue_name) else {
                return;
            };
            let Some(position) = queue.messages.iter().position(|m| m.seq == seq) else {
                return; // already consumed
            };
            let message = queue
                .messages
                .remove(position)
                .map(|m| (m, queue.options.clone()));
            message
        };

        let Some((message, options)) = expired else {
            return;
        };

        let Some(dlx) = options.dead_letter_exchange else {
            tracing::debug!(queue = %queue_name, "message expired with no dead-letter exchange, dropping");
            return;
        };
        let routing_key = options
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());

        let outgoing = OutgoingMessage {
            body: message.body,
            properties: message.properties,
        };
        if let Err(err) = route(&core, &dlx, &routing_key, outgoing).await {
            tracing::error!(queue = %queue_name, error = %err, "failed to dead-letter expired message");
        }
    })
}

/// Returns a message to the front of its queue for redelivery.
async fn requeue_front(core: &Arc<BrokerCore>, queue_name: &str, mut message: QueuedMessage) {
    let mut inner = core.inner.lock().await;
    if let Some(queue) = inner.queues.get_mut(queue_name) {
        message.redelivered = true;
        queue.messages.push_front(message);
        queue.notify.notify_one();
    }
}

struct Unacked {
    queue: String,
    message: QueuedMessage,
    _permit: OwnedSemaphorePermit,
}

/// A channel on the in-process broker.
pub struct MemoryChannel {
    core: Arc<BrokerCore>,
    prefetch: usize,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
    unacked: Arc<Mutex<HashMap<u64, Unacked>>>,
}

impl MemoryChannel {
    fn new(core: Arc<BrokerCore>, prefetch: u16) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            core,
            prefetch: prefetch.max(1) as usize,
            open: AtomicBool::new(true),
            closed_tx,
            unacked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn ensure_open(&self) -> DeliveryResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DeliveryError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> DeliveryResult<()> {
        self.ensure_open()?;
        let mut inner = self.core.inner.lock().await;
        inner
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState { bindings: Vec::new() });
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> DeliveryResult<()> {
        self.ensure_open()?;
        let mut inner = self.core.inner.lock().await;
        match inner.queues.get(name) {
            Some(existing) if existing.options == options => Ok(()),
            Some(_) => Err(DeliveryError::PreconditionFailed(format!(
                "queue '{name}' already declared with different arguments"
            ))),
            None => {
                inner.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        messages: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> DeliveryResult<()> {
        self.ensure_open()?;
        let mut inner = self.core.inner.lock().await;
        if !inner.queues.contains_key(queue) {
            return Err(DeliveryError::PreconditionFailed(format!(
                "queue '{queue}' is not declared"
            )));
        }
        let Some(ex) = inner.exchanges.get_mut(exchange) else {
            return Err(DeliveryError::PreconditionFailed(format!(
                "exchange '{exchange}' is not declared"
            )));
        };
        let binding = (routing_key.to_string(), queue.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> DeliveryResult<()> {
        self.ensure_open()?;
        route(&self.core, exchange, routing_key, message).await
    }

    async fn consume(&self, queue: &str) -> DeliveryResult<mpsc::Receiver<Delivery>> {
        self.ensure_open()?;

        let notify = {
            let inner = self.core.inner.lock().await;
            let Some(state) = inner.queues.get(queue) else {
                return Err(DeliveryError::PreconditionFailed(format!(
                    "queue '{queue}' is not declared"
                )));
            };
            Arc::clone(&state.notify)
        };

        let (tx, rx) = mpsc::channel(1);
        let core = Arc::clone(&self.core);
        let unacked = Arc::clone(&self.unacked);
        let semaphore = Arc::new(Semaphore::new(self.prefetch));
        let mut closed = self.closed_tx.subscribe();
        let queue = queue.to_string();

        tokio::spawn(async move {
            loop {
                // One prefetch slot per outstanding delivery.
                let permit = tokio::select! {
                    _ = closed.changed() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let message = loop {
                    if *closed.borrow() {
                        return;
                    }
                    let popped = {
                        let mut inner = core.inner.lock().await;
                        inner.queues.get_mut(&queue).and_then(|q| q.messages.pop_front())
                    };
                    match popped {
                        Some(message) => break message,
                        None => {
                            tokio::select! {
                                _ = closed.changed() => return,
                                _ = notify.notified() => {}
                            }
                        }
                    }
                };

                let tag = core.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
                let delivery = Delivery {
                    delivery_tag: tag,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                };
                unacked.lock().await.insert(
                    tag,
                    Unacked {
                        queue: queue.clone(),
                        message,
                        _permit: permit,
                    },
                );

                // close() may have drained the unacked map between the pop
                // and the insert above; take the entry back ourselves so the
                // message is requeued rather than stranded.
                if *closed.borrow() {
                    if let Some(entry) = unacked.lock().await.remove(&tag) {
                        requeue_front(&core, &entry.queue, entry.message).await;
                    }
                    break;
                }

                if tx.send(delivery).await.is_err() {
                    // Receiver dropped; put the message back.
                    if let Some(entry) = unacked.lock().await.remove(&tag) {
                        requeue_front(&core, &entry.queue, entry.message).await;
                    }
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> DeliveryResult<()> {
        self.ensure_open()?;
        self.unacked.lock().await.remove(&delivery_tag);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.closed_tx.send(true);

        // Whatever was delivered but never acked goes back for redelivery.
        let entries: Vec<Unacked> = {
            let mut unacked = self.unacked.lock().await;
            unacked.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            requeue_front(&self.core, &entry.queue, entry.message).await;
        }
    }
}

/// A connection on the in-process broker.
pub struct MemoryConnection {
    core: Arc<BrokerCore>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self, prefetch: u16) -> DeliveryResult<Arc<dyn Channel>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(DeliveryError::Connection("connection is closed".to_string()));
        }
        let channel = Arc::new(MemoryChannel::new(Arc::clone(&self.core), prefetch));
        self.channels.lock().await.push(Arc::clone(&channel));
        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<Arc<MemoryChannel>> = {
            let mut channels = self.channels.lock().await;
            channels.drain(..).collect()
        };
        for channel in channels {
            channel.close().await;
        }
    }
}

/// In-process broker. All connections created from one instance share the
/// same exchanges and queues.
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
}

impl MemoryBroker {
    /// Creates a new empty broker.
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore {
                inner: Mutex::new(BrokerInner::default()),
                next_seq: AtomicU64::new(0),
                next_tag: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a shared broker.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of messages currently sitting in a queue, or `None` if the
    /// queue is not declared. Inspection surface for operators and tests.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let inner = self.core.inner.lock().await;
        inner.queues.get(queue).map(|q| q.messages.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _config: &BrokerConfig) -> DeliveryResult<Arc<dyn Connection>> {
        Ok(Arc::new(MemoryConnection {
            core: Arc::clone(&self.core),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

/// Segment-wise topic match: `*` matches exactly one segment, `#` matches
/// zero or more.
fn topic_match(pattern: &str, routing_key: &str) -> bool {
    fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                segments_match(&pattern[1..], key)
                    || (!key.is_empty() && segments_match(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => segments_match(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => segments_match(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

//! Event handler trait and type erasure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DeliveryError, DeliveryResult};
use crate::event::DomainEvent;

/// Trait for typed event handlers.
///
/// Handlers for one event type run sequentially per delivery; a failure
/// aborts the remaining handlers and fails the delivery as a whole. A
/// retried delivery re-invokes every handler, including ones that already
/// succeeded on a prior attempt, so handlers must tolerate at-least-once
/// invocation.
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync {
    /// Returns a unique identifier for this handler.
    fn id(&self) -> &str {
        "anonymous"
    }

    /// Handles an event.
    async fn handle(&self, event: E) -> DeliveryResult<()>;
}

type ErasedFuture = Pin<Box<dyn Future<Output = DeliveryResult<()>> + Send>>;

/// A type-erased handler: deserializes the raw body and invokes the
/// wrapped typed handler. Built once at composition time, so dispatch at
/// runtime is a table lookup, not reflection.
pub struct ErasedHandler {
    id: String,
    handler: Box<dyn Fn(Vec<u8>) -> ErasedFuture + Send + Sync>,
}

impl ErasedHandler {
    /// Wraps a typed handler for event type `E`.
    pub(crate) fn wrap<E, H>(handler: H) -> Self
    where
        E: DomainEvent + 'static,
        H: EventHandler<E> + 'static,
    {
        let id = handler.id().to_string();
        let handler = Arc::new(handler);
        Self {
            id,
            handler: Box::new(move |body: Vec<u8>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let event = serde_json::from_slice::<E>(&body)
                        .map_err(|e| DeliveryError::Serialization(e.to_string()))?;
                    handler.handle(event).await
                })
            }),
        }
    }

    /// The wrapped handler's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deserializes the body and invokes the handler.
    pub(crate) async fn invoke(&self, body: &[u8]) -> DeliveryResult<()> {
        (self.handler)(body.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct MeterRead {
        id: Uuid,
        version: u64,
        kwh: f64,
    }

    impl DomainEvent for MeterRead {
        fn event_type() -> &'static str {
            "MeterRead"
        }

        fn event_id(&self) -> Uuid {
            self.id
        }

        fn version(&self) -> u64 {
            self.version
        }
    }

    struct Recording {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl EventHandler<MeterRead> for Recording {
        fn id(&self) -> &str {
            "recording"
        }

        async fn handle(&self, event: MeterRead) -> DeliveryResult<()> {
            assert!(event.kwh > 0.0);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_erased_handler_deserializes_and_invokes() {
        let calls = Arc::new(AtomicU32::new(0));
        let erased = ErasedHandler::wrap::<MeterRead, _>(Recording { calls: calls.clone() });
        assert_eq!(erased.id(), "recording");

        let event = MeterRead { id: Uuid::new_v4(), version: 1, kwh: 12.5 };
        let body = serde_json::to_vec(&event).unwrap();

        erased.invoke(&body).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_serialization_error() {
        let erased = ErasedHandler::wrap::<MeterRead, _>(Recording {
            calls: Arc::new(AtomicU32::new(0)),
        });

        let err = erased.invoke(b"not json").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Serialization(_)));
    }
}

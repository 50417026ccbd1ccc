//! Event type registry and dispatch table.
//!
//! The registry is built once during startup composition and frozen; it
//! is passed by reference into the consumer and the dead-letter
//! processor. There is no ambient or static registration, and no runtime
//! reflection: dispatch is a map from event type name to the handler
//! closures erased at registration time.
//!
//! Registration must complete before [`crate::consumer::EventConsumer::start`]
//! runs. Types registered afterward are never bound to queues and their
//! events are undeliverable until a restart; this is a fixed
//! startup-order requirement.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::DomainEvent;
use crate::handler::{ErasedHandler, EventHandler};

/// A registered event type with its handlers.
pub struct EventTypeBinding {
    type_name: String,
    handlers: Vec<Arc<ErasedHandler>>,
}

impl EventTypeBinding {
    /// The event type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Number of handlers subscribed to this type.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn handlers(&self) -> &[Arc<ErasedHandler>] {
        &self.handlers
    }
}

/// Immutable mapping from event type name to its handlers.
pub struct HandlerRegistry {
    bindings: HashMap<String, EventTypeBinding>,
}

impl HandlerRegistry {
    /// Starts building a registry.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder { bindings: HashMap::new() }
    }

    /// Iterates over the registered event type names.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Looks up the binding for a type name.
    pub fn binding(&self, type_name: &str) -> Option<&EventTypeBinding> {
        self.bindings.get(type_name)
    }

    /// Whether a type name is registered.
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.bindings.contains_key(type_name)
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Builder for [`HandlerRegistry`], used during startup composition.
pub struct HandlerRegistryBuilder {
    bindings: HashMap<String, EventTypeBinding>,
}

impl HandlerRegistryBuilder {
    /// Registers an event type without subscribing a handler. Idempotent:
    /// registering the same type twice is a no-op. A type that does not
    /// implement [`DomainEvent`] is rejected at compile time.
    pub fn register_event_type<E: DomainEvent + 'static>(mut self) -> Self {
        self.ensure_binding(E::event_type());
        self
    }

    /// Subscribes a handler to event type `E`, registering the type if
    /// needed. Handlers run in subscription order.
    pub fn subscribe<E, H>(mut self, handler: H) -> Self
    where
        E: DomainEvent + 'static,
        H: EventHandler<E> + 'static,
    {
        let erased = Arc::new(ErasedHandler::wrap::<E, _>(handler));
        self.ensure_binding(E::event_type()).handlers.push(erased);
        self
    }

    /// Freezes the registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { bindings: self.bindings }
    }

    fn ensure_binding(&mut self, type_name: &str) -> &mut EventTypeBinding {
        self.bindings
            .entry(type_name.to_string())
            .or_insert_with(|| EventTypeBinding {
                type_name: type_name.to_string(),
                handlers: Vec::new(),
            })
    }
}

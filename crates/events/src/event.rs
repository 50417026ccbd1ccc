//! Domain event trait.

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// A domain event: an immutable record of a business fact.
///
/// The type name is the routing discriminator; its lowercase form becomes
/// the routing key on the main exchange. Events are created once, never
/// mutated, and may be consumed any number of times by any number of
/// handlers.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// The event type name, unique across the process.
    fn event_type() -> &'static str
    where
        Self: Sized;

    /// Globally unique id of this event instance.
    fn event_id(&self) -> Uuid;

    /// Logical version number of the event.
    fn version(&self) -> u64;
}

//! Delivery error types.

use thiserror::Error;

/// Result type for event-delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Error type for the event-delivery subsystem.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The broker could not be reached or the connection was refused.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The channel was closed while an operation was in flight.
    #[error("Channel closed")]
    ChannelClosed,

    /// A declaration conflicted with existing broker state
    /// (e.g. re-declaring a queue with different arguments).
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Event serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Event type not present in the handler registry.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A handler returned an error for a delivery.
    #[error("Handler '{handler}' failed: {message}")]
    HandlerFailed {
        /// Identifier of the failing handler.
        handler: String,
        /// Error message reported by the handler.
        message: String,
    },

    /// Failed-message store error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// No failed-message record exists for the given id.
    #[error("Failed message '{0}' not found")]
    NotFound(String),

    /// An operation did not complete within its deadline.
    #[error("Operation timed out")]
    Timeout,
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}

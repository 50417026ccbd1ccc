//! Wire-level message types and header names.

use std::collections::HashMap;

/// JSON content type attached to every published event.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Header names carried on the message envelope.
pub mod headers {
    /// Logical version of the event.
    pub const EVENT_VERSION: &str = "x-event-version";
    /// Number of retries already attempted.
    pub const RETRY_COUNT: &str = "x-retry-count";
    /// Error text from the most recent failed attempt.
    pub const LAST_ERROR: &str = "x-last-error";
    /// Exchange the message was originally published to.
    pub const ORIGINAL_EXCHANGE: &str = "x-original-exchange";
    /// Routing key the message was originally published with.
    pub const ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
    /// Timestamp of the failure that routed the message here.
    pub const FAILED_AT: &str = "x-failed-at";
}

/// Delivery metadata attached to a published message.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    /// Message id; set to the event id on publish.
    pub message_id: Option<String>,
    /// Event type name.
    pub type_name: Option<String>,
    /// Content type of the body.
    pub content_type: Option<String>,
    /// Whether the message survives a broker restart.
    pub persistent: bool,
    /// Custom headers.
    pub headers: HashMap<String, String>,
}

impl MessageProperties {
    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Sets a header value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Reads the retry counter; an absent or unparseable header reads as 0.
    pub fn retry_count(&self) -> u32 {
        self.header(headers::RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// A message about to be published.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Serialized body.
    pub body: Vec<u8>,
    /// Delivery metadata.
    pub properties: MessageProperties,
}

/// A message as seen by a consumer, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Exchange the message arrived through.
    pub exchange: String,
    /// Routing key the message was delivered with.
    pub routing_key: String,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Raw body.
    pub body: Vec<u8>,
    /// Delivery metadata.
    pub properties: MessageProperties,
}

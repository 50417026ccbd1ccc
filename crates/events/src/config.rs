//! Broker configuration.

use std::time::Duration;

/// Configuration for the broker connection and delivery topology.
///
/// Every field is overridable; the defaults match a local broker with the
/// standard Electricity Shop exchanges.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Username for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: String,
    /// Virtual host.
    pub virtual_host: String,
    /// Whether to connect over TLS.
    pub use_tls: bool,
    /// Name of the main topic exchange events are published to.
    pub exchange: String,
    /// Name of the dead-letter exchange backing the retry and error queues.
    pub dead_letter_exchange: String,
    /// Maximum number of retries before a message is routed to the error queue.
    pub max_retries: u32,
    /// Delay between retries, applied as the retry queue's message TTL.
    pub retry_interval: Duration,
    /// Deadline for establishing a broker connection.
    pub connection_timeout: Duration,
    /// Maximum unacknowledged deliveries per channel.
    pub prefetch: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            use_tls: false,
            exchange: "main".to_string(),
            dead_letter_exchange: "dead-letter".to_string(),
            max_retries: 3,
            retry_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(15),
            prefetch: 10,
        }
    }
}

impl BrokerConfig {
    /// Sets the maximum retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retry interval (the retry queue's message TTL).
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the per-channel prefetch count.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Renders the broker address for adapters that dial a real broker.
    pub fn addr(&self) -> String {
        let scheme = if self.use_tls { "amqps" } else { "amqp" };
        format!(
            "{}://{}:{}/{}",
            scheme,
            self.host,
            self.port,
            self.virtual_host.trim_start_matches('/')
        )
    }
}

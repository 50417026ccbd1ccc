//! Broker connection management.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::{Broker, Channel, Connection};
use crate::config::BrokerConfig;
use crate::error::{DeliveryError, DeliveryResult};

/// Owns the single long-lived broker connection and hands out channels.
///
/// The connection is created lazily and transparently re-established when
/// the cached one reports closed. If the broker is unreachable the call
/// fails with a connection error; callers treat that as transient and
/// retry through their own supervision.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl ConnectionManager {
    /// Creates a manager dialing through the given broker.
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
        Self {
            broker,
            config,
            connection: Mutex::new(None),
        }
    }

    /// Creates a shared manager.
    pub fn shared(broker: Arc<dyn Broker>, config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self::new(broker, config))
    }

    /// The configuration this manager connects with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Returns a healthy connection, reconnecting if none exists or the
    /// cached one reports closed.
    pub async fn get_connection(&self) -> DeliveryResult<Arc<dyn Connection>> {
        let mut guard = self.connection.lock().await;

        if let Some(connection) = guard.as_ref() {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
            tracing::info!(addr = %self.config.addr(), "broker connection shut down, reconnecting");
            *guard = None;
        }

        let connection = tokio::time::timeout(
            self.config.connection_timeout,
            self.broker.connect(&self.config),
        )
        .await
        .map_err(|_| {
            DeliveryError::Connection(format!(
                "timed out connecting to {}",
                self.config.addr()
            ))
        })??;

        tracing::info!(addr = %self.config.addr(), "broker connection established");
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Opens a fresh channel with the configured prefetch count applied.
    pub async fn create_channel(&self) -> DeliveryResult<Arc<dyn Channel>> {
        let connection = self.get_connection().await?;
        connection.create_channel(self.config.prefetch).await
    }

    /// Closes the cached connection, if any. Logged, never an error.
    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.close().await;
            tracing::info!("broker connection closed");
        }
    }
}

//! Fan-out publisher.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::ChannelEnvelope;
use crate::config::{self, BrokerConfig, BrokerOptions};
use crate::connection;
use crate::error::{BrokerError, Result};
use crate::keys::KeyBuilder;

/// Publishes framed messages on one pub/sub channel.
///
/// Delivery is fire-and-forget per recipient; the only feedback is the
/// recipient count returned by the backend, checked against
/// `minimum_recipients`.
pub struct Publisher {
    id: String,
    channel_name: String,
    channel: String,
    config: BrokerConfig,
    conn: Mutex<Option<ConnectionManager>>,
}

impl Publisher {
    /// Prepare a publisher for a channel. Performs no I/O.
    pub fn new(channel_name: impl Into<String>, options: BrokerOptions) -> Self {
        let config = config::apply(options);
        let keys = KeyBuilder::new(config.redis.prefix.clone());
        let channel_name = channel_name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            channel: keys.channel(&channel_name),
            channel_name,
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open the command connection. Fails with
    /// [`BrokerError::AlreadyConnected`] when called twice without an
    /// intervening disconnect.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Err(BrokerError::AlreadyConnected);
        }
        *conn = Some(connection::command_connection(&self.config.redis).await?);

        info!(publisher = %self.id, channel = %self.channel_name, "Publisher connected");
        Ok(())
    }

    /// Close the connection. Idempotent; resolves quietly when never
    /// connected.
    pub async fn disconnect(&self) -> Result<()> {
        if self.conn.lock().await.take().is_some() {
            info!(publisher = %self.id, channel = %self.channel_name, "Publisher disconnected");
        }
        Ok(())
    }

    /// Publish a framed message and return the recipient count.
    ///
    /// Fails with [`BrokerError::InsufficientRecipients`] when fewer than
    /// `minimum_recipients` subscribers were listening; the subscribers that
    /// were listening still received the message.
    pub async fn publish(&self, message: Value) -> Result<u64> {
        let mut conn = match self.conn.lock().await.as_ref() {
            Some(conn) => conn.clone(),
            None => return Err(BrokerError::NotConnected),
        };

        let frame = ChannelEnvelope::new(Uuid::new_v4().to_string(), message);
        let recipients: u64 = conn.publish(&self.channel, frame.encode()).await?;

        if recipients < self.config.minimum_recipients {
            return Err(BrokerError::InsufficientRecipients {
                required: self.config.minimum_recipients,
                actual: recipients,
            });
        }

        debug!(
            publisher = %self.id,
            channel = %self.channel_name,
            message = %frame.id,
            recipients,
            "Message published"
        );
        Ok(recipients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let publisher = Publisher::new("test", BrokerOptions::default());
        assert!(matches!(
            publisher.publish(json!("message")).await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_resolves() {
        let publisher = Publisher::new("test", BrokerOptions::default());
        publisher.disconnect().await.unwrap();
        publisher.disconnect().await.unwrap();
    }
}

//! Backend connection helpers.
//!
//! The backend restricts a subscribed connection to pub/sub commands, so
//! every participant that both subscribes and issues commands holds two
//! connections: a [`ConnectionManager`] for commands and a [`PubSub`] for
//! subscriptions. Connections are owned by exactly one participant (or one
//! in-flight request) and closed by drop on every exit path.

use redis::aio::{ConnectionManager, PubSub};
use redis::Client;
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{BrokerError, Result};

/// Open a command connection. Reconnects transparently while held.
pub(crate) async fn command_connection(config: &RedisConfig) -> Result<ConnectionManager> {
    let conn = ConnectionManager::new(open_client(config)?)
        .await
        .map_err(|e| BrokerError::Connection(format!("Failed to connect to {}: {}", config.url, e)))?;

    debug!(url = %config.url, "Command connection opened");
    Ok(conn)
}

/// Open a pub/sub connection, returning the client alongside so the owner
/// can open a replacement connection if the stream drops.
pub(crate) async fn pubsub_connection(config: &RedisConfig) -> Result<(Client, PubSub)> {
    let client = open_client(config)?;
    let pubsub = client.get_async_pubsub().await.map_err(|e| {
        BrokerError::Connection(format!("Failed to connect to {}: {}", config.url, e))
    })?;

    debug!(url = %config.url, "Subscriber connection opened");
    Ok((client, pubsub))
}

pub(crate) fn open_client(config: &RedisConfig) -> Result<Client> {
    Client::open(config.url.as_str())
        .map_err(|e| BrokerError::Connection(format!("Invalid redis URL {}: {}", config.url, e)))
}

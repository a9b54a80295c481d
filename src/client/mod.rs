//! RPC client: enqueue requests and await their responses.
//!
//! A request travels as `RPUSH` onto the queue list followed by an empty
//! notification publish that wakes idle workers. The response comes back on
//! a request-specific channel watched by a dedicated short-lived subscriber
//! connection, so concurrent requests never share a listener. The `RPUSH`
//! before `PUBLISH` ordering guarantees a woken worker sees the item.

mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client as RedisClient};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{RequestEnvelope, ResponseBody, ResponseEnvelope, NOTIFICATION_PAYLOAD};
use crate::config::{self, BrokerConfig, BrokerOptions};
use crate::connection;
use crate::error::{BrokerError, Result};
use crate::keys::KeyBuilder;
use tracker::RunningRequests;

/// An RPC client bound to one request queue.
///
/// `request` calls may run concurrently on one client; each gets its own
/// response connection and resolves independently.
pub struct Client {
    id: String,
    queue_name: String,
    queue_key: String,
    notify_channel: String,
    keys: KeyBuilder,
    config: BrokerConfig,
    shutting_down: AtomicBool,
    tracker: RunningRequests,
    link: Mutex<Option<Link>>,
}

struct Link {
    client: RedisClient,
    conn: ConnectionManager,
}

impl Client {
    /// Prepare a client for a queue. Performs no I/O; configuration and key
    /// names are resolved here and never change afterwards.
    pub fn new(queue_name: impl Into<String>, options: BrokerOptions) -> Self {
        let config = config::apply(options);
        let keys = KeyBuilder::new(config.redis.prefix.clone());
        let queue_name = queue_name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            queue_key: keys.queue(&queue_name),
            notify_channel: keys.notifications(&queue_name),
            keys,
            config,
            queue_name,
            shutting_down: AtomicBool::new(false),
            tracker: RunningRequests::default(),
            link: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open the command connection. A connect on an already-connected
    /// client is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        self.shutting_down.store(false, Ordering::SeqCst);
        if link.is_some() {
            return Ok(());
        }

        let client = connection::open_client(&self.config.redis)?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            BrokerError::Connection(format!(
                "Failed to connect to {}: {}",
                self.config.redis.url, e
            ))
        })?;
        *link = Some(Link { client, conn });

        info!(client = %self.id, queue = %self.queue_name, "Client connected");
        Ok(())
    }

    /// Close the command connection once every in-flight request has
    /// terminated (completed or timed out). Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.tracker.wait_drained().await;

        if self.link.lock().await.take().is_some() {
            info!(client = %self.id, queue = %self.queue_name, "Client disconnected");
        }
        Ok(())
    }

    /// Send one request and await its response.
    ///
    /// Resolves with the handler's return value, or fails with the error the
    /// handler raised ([`BrokerError::Remote`]), or [`BrokerError::Timeout`]
    /// when no response arrives within the configured window.
    pub async fn request(&self, data: Value) -> Result<Value> {
        let (redis, mut conn) = {
            let link = self.link.lock().await;
            let Some(link) = link.as_ref() else {
                return Err(BrokerError::NotConnected);
            };
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(BrokerError::ShuttingDown);
            }
            (link.client.clone(), link.conn.clone())
        };

        let request_id = Uuid::new_v4().to_string();
        let response_channel = self.keys.response(&request_id);

        // Dedicated short-lived subscriber connection: a subscribed
        // connection cannot issue commands, and per-request isolation keeps
        // concurrent responses from cross-talking.
        let mut pubsub = redis.get_async_pubsub().await.map_err(|e| {
            BrokerError::Connection(format!("Failed to open response connection: {e}"))
        })?;

        self.tracker.add(request_id.clone(), self.config.timeout()).await;
        let result = self
            .exchange(&mut pubsub, &mut conn, &request_id, &response_channel, data)
            .await;

        if let Err(e) = pubsub.unsubscribe(&response_channel).await {
            debug!(client = %self.id, request = %request_id, error = %e, "Unsubscribe failed during request cleanup");
        }
        drop(pubsub);
        self.tracker.finish(&request_id).await;

        result
    }

    async fn exchange(
        &self,
        pubsub: &mut PubSub,
        conn: &mut ConnectionManager,
        request_id: &str,
        response_channel: &str,
        data: Value,
    ) -> Result<Value> {
        pubsub.subscribe(response_channel).await.map_err(|e| {
            BrokerError::Subscribe(format!("Failed to subscribe to {response_channel}: {e}"))
        })?;

        let payload = RequestEnvelope::new(request_id, data).encode();
        let _: () = conn.rpush(&self.queue_key, payload).await?;
        let recipients: i64 = conn.publish(&self.notify_channel, NOTIFICATION_PAYLOAD).await?;
        if recipients == 0 {
            info!(client = %self.id, queue = %self.queue_name, request = %request_id, "No active worker on queue, waiting for one to arrive");
        }
        debug!(client = %self.id, queue = %self.queue_name, request = %request_id, "Request enqueued");

        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        let mut stream = pubsub.on_message();
        loop {
            let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => return Err(BrokerError::Timeout(timeout)),
                Ok(None) => {
                    return Err(BrokerError::Connection(
                        "Response subscription closed".to_string(),
                    ))
                }
                Ok(Some(msg)) => msg,
            };
            let raw: String = match msg.get_payload() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(client = %self.id, request = %request_id, error = %e, "Discarding unreadable response");
                    continue;
                }
            };
            // Protocol damage is not fatal: skip the frame and let the
            // timeout be the safety net.
            let response = match ResponseEnvelope::decode(&raw) {
                Ok(response) => response,
                Err(e) => {
                    warn!(client = %self.id, request = %request_id, error = %e, "Discarding malformed response");
                    continue;
                }
            };
            return match response.body {
                ResponseBody::Success(value) => Ok(value),
                ResponseBody::Failure(error) => Err(BrokerError::Remote(error)),
            };
        }
    }
}

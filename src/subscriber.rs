//! Fan-out subscriber.
//!
//! A subscriber owns one pub/sub connection and invokes its handler for
//! every frame on the channel. Handler failures are logged and swallowed;
//! they never stop the subscriber and are invisible to publishers.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use futures::StreamExt;
use redis::aio::PubSub;
use redis::{Client as RedisClient, Msg};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::ChannelEnvelope;
use crate::config::{self, BrokerConfig, BrokerOptions};
use crate::connection;
use crate::error::{BrokerError, Result};
use crate::keys::KeyBuilder;

/// Error raised by a message handler. Only ever logged.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler invoked for every message received on the channel.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Value) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: Value) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(message))
    }
}

/// A subscriber bound to one pub/sub channel.
pub struct Subscriber {
    id: String,
    channel_name: String,
    channel: String,
    handler: Arc<dyn MessageHandler>,
    config: BrokerConfig,
    runtime: tokio::sync::Mutex<Option<ListenRuntime>>,
}

struct ListenRuntime {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscriber {
    /// Prepare a subscriber for a channel. Performs no I/O.
    pub fn new(
        channel_name: impl Into<String>,
        handler: impl MessageHandler + 'static,
        options: BrokerOptions,
    ) -> Self {
        let config = config::apply(options);
        let keys = KeyBuilder::new(config.redis.prefix.clone());
        let channel_name = channel_name.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: keys.channel(&channel_name),
            channel_name,
            handler: Arc::new(handler),
            config,
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe and start dispatching messages to the handler.
    pub async fn listen(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(BrokerError::AlreadyListening);
        }

        let (client, mut pubsub) = connection::pubsub_connection(&self.config.redis).await?;
        pubsub.subscribe(&self.channel).await.map_err(|e| {
            BrokerError::Subscribe(format!("Failed to subscribe to {}: {}", self.channel, e))
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = ConsumeTask {
            subscriber_id: self.id.clone(),
            channel_name: self.channel_name.clone(),
            channel: self.channel.clone(),
            handler: Arc::clone(&self.handler),
            client,
            shutdown: shutdown_rx,
        };
        *runtime = Some(ListenRuntime {
            shutdown: shutdown_tx,
            task: tokio::spawn(task.run(pubsub)),
        });

        info!(subscriber = %self.id, channel = %self.channel_name, "Subscriber listening");
        Ok(())
    }

    /// Unsubscribe and close the connection. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return Ok(());
        };

        let _ = runtime.shutdown.send(true);
        if let Err(e) = runtime.task.await {
            warn!(subscriber = %self.id, error = %e, "Consume task ended abnormally");
        }

        info!(subscriber = %self.id, channel = %self.channel_name, "Subscriber stopped");
        Ok(())
    }
}

struct ConsumeTask {
    subscriber_id: String,
    channel_name: String,
    channel: String,
    handler: Arc<dyn MessageHandler>,
    client: RedisClient,
    shutdown: watch::Receiver<bool>,
}

impl ConsumeTask {
    async fn run(mut self, mut pubsub: PubSub) {
        loop {
            let stream_ended = {
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = self.shutdown.changed() => break false,
                        msg = stream.next() => match msg {
                            Some(msg) => self.dispatch(msg).await,
                            None => break true,
                        },
                    }
                }
            };

            if !stream_ended {
                break;
            }
            if !self.resubscribe(&mut pubsub).await {
                break;
            }
        }

        self.finish(pubsub).await;
    }

    async fn dispatch(&self, msg: Msg) {
        let raw: String = match msg.get_payload() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(subscriber = %self.subscriber_id, channel = %self.channel_name, error = %e, "Discarding unreadable message");
                return;
            }
        };
        let frame = match ChannelEnvelope::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(subscriber = %self.subscriber_id, channel = %self.channel_name, error = %e, "Discarding malformed message");
                return;
            }
        };

        debug!(subscriber = %self.subscriber_id, channel = %self.channel_name, message = %frame.id, "Message received");
        if let Err(e) = self.handler.handle(frame.message).await {
            warn!(subscriber = %self.subscriber_id, channel = %self.channel_name, message = %frame.id, error = %e, "Message handler failed");
        }
    }

    /// Reopen the subscription after the stream dropped. Returns false when
    /// shutdown was requested while backing off.
    async fn resubscribe(&mut self, pubsub: &mut PubSub) -> bool {
        warn!(subscriber = %self.subscriber_id, channel = %self.channel_name, "Message stream ended, resubscribing");
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut delays = backoff.build();

        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            match self.open_subscription().await {
                Ok(fresh) => {
                    *pubsub = fresh;
                    debug!(subscriber = %self.subscriber_id, channel = %self.channel_name, "Resubscribed");
                    return true;
                }
                Err(e) => {
                    let delay = delays.next().unwrap_or(Duration::from_secs(30));
                    warn!(
                        subscriber = %self.subscriber_id,
                        channel = %self.channel_name,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Resubscribe failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    async fn open_subscription(&self) -> Result<PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        Ok(pubsub)
    }

    async fn finish(self, mut pubsub: PubSub) {
        if let Err(e) = pubsub.unsubscribe(&self.channel).await {
            debug!(subscriber = %self.subscriber_id, error = %e, "Unsubscribe failed during shutdown");
        }
        drop(pubsub);
        debug!(subscriber = %self.subscriber_id, channel = %self.channel_name, "Consume task exited");
    }
}

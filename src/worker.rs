//! Request worker: admission and dispatch.
//!
//! A worker subscribes to the wake-up notification channel for its queue and
//! claims work with `LPOP` on a command connection. Notifications are
//! advisory: two workers woken by the same notification race at `LPOP` and
//! at most one wins, which makes the claim race-free without distributed
//! locks. The queue list itself is the authoritative work signal: a worker
//! that missed a notification finds the item through its queue check.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client as RedisClient};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{ErrorPayload, RequestEnvelope, ResponseEnvelope};
use crate::config::{self, BrokerConfig, BrokerOptions};
use crate::connection;
use crate::error::{BrokerError, Result};
use crate::keys::KeyBuilder;

/// Outcome of a worker handler invocation.
pub type HandlerResult = std::result::Result<Value, ErrorPayload>;

/// Handler executing one claimed request.
///
/// A raised [`ErrorPayload`] is serialized into the error response and
/// re-raised on the client; it is not fatal to the worker.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, data: Value) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, data: Value) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(data))
    }
}

/// Dispatch state of a worker.
///
/// A worker that is not listening reports `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Listening, no request in flight.
    Idle,
    /// Executing a claimed request.
    Working,
    /// Stop requested while working; finishes the current request, then
    /// shuts down.
    Draining,
    /// Not listening.
    Stopped,
}

/// A worker bound to one request queue.
///
/// Holds two backend connections while listening: a subscriber connection
/// restricted to pub/sub and a command connection for `LPOP`/`PUBLISH`.
/// At most one request is in flight per worker at any time.
pub struct Worker {
    id: String,
    queue_name: String,
    handler: Arc<dyn RequestHandler>,
    config: BrokerConfig,
    keys: KeyBuilder,
    state: Arc<Mutex<WorkerState>>,
    runtime: tokio::sync::Mutex<Option<ListenRuntime>>,
}

struct ListenRuntime {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Worker {
    /// Prepare a worker for a queue. Performs no I/O; configuration and key
    /// names are resolved here and never change afterwards.
    pub fn new(
        queue_name: impl Into<String>,
        handler: impl RequestHandler + 'static,
        options: BrokerOptions,
    ) -> Self {
        let config = config::apply(options);
        let keys = KeyBuilder::new(config.redis.prefix.clone());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            handler: Arc::new(handler),
            config,
            keys,
            state: Arc::new(Mutex::new(WorkerState::Stopped)),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state lock poisoned")
    }

    /// Open both connections, subscribe to the notification channel, and
    /// start dispatching. The first action of the dispatch task is a queue
    /// check, so work enqueued before the subscription is still found.
    pub async fn listen(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(BrokerError::AlreadyListening);
        }

        let notify_channel = self.keys.notifications(&self.queue_name);
        let (client, mut pubsub) = connection::pubsub_connection(&self.config.redis).await?;
        pubsub.subscribe(&notify_channel).await.map_err(|e| {
            BrokerError::Subscribe(format!("Failed to subscribe to {notify_channel}: {e}"))
        })?;
        let conn = connection::command_connection(&self.config.redis).await?;

        *self.state.lock().expect("worker state lock poisoned") = WorkerState::Idle;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = DispatchTask {
            worker_id: self.id.clone(),
            queue_name: self.queue_name.clone(),
            queue_key: self.keys.queue(&self.queue_name),
            notify_channel,
            keys: self.keys.clone(),
            handler: Arc::clone(&self.handler),
            state: Arc::clone(&self.state),
            conn,
            client,
            shutdown: shutdown_rx,
        };
        *runtime = Some(ListenRuntime {
            shutdown: shutdown_tx,
            task: tokio::spawn(task.run(pubsub)),
        });

        info!(worker = %self.id, queue = %self.queue_name, "Worker listening");
        Ok(())
    }

    /// Stop listening. Idempotent; resolves once the dispatch task has
    /// exited and both connections are closed. A request in flight is
    /// finished first (its response is still published if possible).
    pub async fn stop(&self) -> Result<()> {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return Ok(());
        };

        {
            let mut state = self.state.lock().expect("worker state lock poisoned");
            if *state == WorkerState::Working {
                *state = WorkerState::Draining;
            }
        }
        let _ = runtime.shutdown.send(true);
        if let Err(e) = runtime.task.await {
            warn!(worker = %self.id, error = %e, "Dispatch task ended abnormally");
        }

        info!(worker = %self.id, queue = %self.queue_name, "Worker stopped");
        Ok(())
    }
}

enum Claim {
    /// A request was claimed and executed.
    Handled,
    /// The pop returned nothing; another worker won the race.
    Empty,
    /// A backend command failed; already logged.
    Failed,
}

struct DispatchTask {
    worker_id: String,
    queue_name: String,
    queue_key: String,
    notify_channel: String,
    keys: KeyBuilder,
    handler: Arc<dyn RequestHandler>,
    state: Arc<Mutex<WorkerState>>,
    conn: ConnectionManager,
    client: RedisClient,
    shutdown: watch::Receiver<bool>,
}

impl DispatchTask {
    async fn run(mut self, mut pubsub: PubSub) {
        if !self.check_queue().await {
            self.finish(pubsub).await;
            return;
        }

        loop {
            let stream_ended = {
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = self.shutdown.changed() => break false,
                        msg = stream.next() => match msg {
                            Some(_) => {
                                if !self.on_notification().await {
                                    break false;
                                }
                            }
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

    /// React to a wake-up. The notification carries no payload; `LPOP` is
    /// the authoritative claim. Returns false when shutdown was requested.
    async fn on_notification(&mut self) -> bool {
        match self.claim_one().await {
            Claim::Handled => {
                if self.stop_requested() {
                    return false;
                }
                self.check_queue().await
            }
            Claim::Empty | Claim::Failed => true,
        }
    }

    /// Drain pending work discovered through `LLEN`. Runs at startup, after
    /// each handled request, and after a resubscribe. Returns false when
    /// shutdown was requested.
    async fn check_queue(&mut self) -> bool {
        loop {
            if self.stop_requested() {
                return false;
            }
            let pending: u64 = match self.conn.llen(&self.queue_key).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(worker = %self.worker_id, queue = %self.queue_name, error = %e, "Queue check failed");
                    return true;
                }
            };
            if pending == 0 {
                return true;
            }
            match self.claim_one().await {
                Claim::Handled => {
                    if self.stop_requested() {
                        return false;
                    }
                }
                Claim::Empty | Claim::Failed => return true,
            }
        }
    }

    /// Atomically claim one queued request and execute it.
    async fn claim_one(&mut self) -> Claim {
        let popped: Option<String> = match self.conn.lpop(&self.queue_key, None).await {
            Ok(item) => item,
            Err(e) => {
                warn!(worker = %self.worker_id, queue = %self.queue_name, error = %e, "Claim failed");
                return Claim::Failed;
            }
        };
        let Some(raw) = popped else {
            debug!(worker = %self.worker_id, queue = %self.queue_name, "Queue empty on claim, another worker won");
            return Claim::Empty;
        };

        self.set_state(WorkerState::Working);
        let response = match RequestEnvelope::decode(&raw) {
            Ok(request) => {
                debug!(worker = %self.worker_id, queue = %self.queue_name, request = %request.id, "Request claimed");
                let body = self.handler.handle(request.data).await;
                match body {
                    Ok(value) => ResponseEnvelope::success(request.id, value),
                    Err(error) => ResponseEnvelope::failure(request.id, error),
                }
            }
            Err(e) => {
                warn!(worker = %self.worker_id, queue = %self.queue_name, error = %e, "Discarding malformed request");
                self.end_request();
                return Claim::Handled;
            }
        };

        let channel = self.keys.response(&response.id);
        let published: redis::RedisResult<i64> = self.conn.publish(&channel, response.encode()).await;
        match published {
            Ok(0) => {
                // Client already gone; at-most-once response delivery is
                // accepted, the client timeout is the safety net.
                warn!(worker = %self.worker_id, request = %response.id, "Response had no receiver, dropping")
            }
            Ok(_) => {
                debug!(worker = %self.worker_id, request = %response.id, "Response published")
            }
            Err(e) => {
                warn!(worker = %self.worker_id, request = %response.id, error = %e, "Response publish failed")
            }
        }

        self.end_request();
        Claim::Handled
    }

    /// Reopen the notification subscription after the stream dropped.
    /// Returns false when shutdown was requested while backing off.
    async fn resubscribe(&mut self, pubsub: &mut PubSub) -> bool {
        warn!(worker = %self.worker_id, queue = %self.queue_name, "Notification stream ended, resubscribing");
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut delays = backoff.build();

        loop {
            if self.stop_requested() {
                return false;
            }
            match self.open_subscription().await {
                Ok(fresh) => {
                    *pubsub = fresh;
                    debug!(worker = %self.worker_id, queue = %self.queue_name, "Resubscribed");
                    return self.check_queue().await;
                }
                Err(e) => {
                    let delay = delays.next().unwrap_or(Duration::from_secs(30));
                    warn!(
                        worker = %self.worker_id,
                        queue = %self.queue_name,
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
            .subscribe(&self.notify_channel)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        Ok(pubsub)
    }

    async fn finish(self, mut pubsub: PubSub) {
        if let Err(e) = pubsub.unsubscribe(&self.notify_channel).await {
            debug!(worker = %self.worker_id, error = %e, "Unsubscribe failed during shutdown");
        }
        drop(pubsub);
        self.set_state(WorkerState::Stopped);
        debug!(worker = %self.worker_id, queue = %self.queue_name, "Dispatch task exited");
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, next: WorkerState) {
        *self.state.lock().expect("worker state lock poisoned") = next;
    }

    /// Working → Idle, unless a stop moved the worker to Draining while the
    /// handler ran.
    fn end_request(&self) {
        let mut state = self.state.lock().expect("worker state lock poisoned");
        if *state == WorkerState::Working {
            *state = WorkerState::Idle;
        }
    }
}

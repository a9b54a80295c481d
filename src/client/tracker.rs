//! In-flight request tracking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

/// Pending request ids with a drained signal.
///
/// `disconnect` waits on the signal before closing the command connection.
/// Every `add` also arms an automatic expiry, so a pathological request that
/// never resolves cannot block disconnect forever.
#[derive(Clone)]
pub(crate) struct RunningRequests {
    inner: Arc<Inner>,
}

struct Inner {
    pending: Mutex<HashSet<String>>,
    count: watch::Sender<usize>,
}

impl Default for RunningRequests {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::default(),
                count: watch::channel(0).0,
            }),
        }
    }
}

impl RunningRequests {
    /// Register a request and arm its automatic expiry.
    pub(crate) async fn add(&self, id: String, expiry: Duration) {
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id.clone());
            self.inner.count.send_replace(pending.len());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            inner.remove(&id).await;
        });
    }

    /// Mark a request as terminated. Idempotent; the automatic expiry and
    /// the request cleanup path may both call this.
    pub(crate) async fn finish(&self, id: &str) {
        self.inner.remove(id).await;
    }

    /// Resolve once no requests are pending. Returns immediately when the
    /// set is already empty.
    pub(crate) async fn wait_drained(&self) {
        let mut count = self.inner.count.subscribe();
        let _ = count.wait_for(|pending| *pending == 0).await;
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl Inner {
    async fn remove(&self, id: &str) {
        let mut pending = self.pending.lock().await;
        if pending.remove(id) {
            self.count.send_replace(pending.len());
        }
    }
}

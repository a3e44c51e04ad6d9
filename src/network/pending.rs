//! Pending-request correlation
//!
//! Outgoing broadcast requests register their `requestId` here; response
//! handlers resolve matching entries. The caller decides how long to wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Table of in-flight requests awaiting responses of type `R`
pub struct PendingRequests<R> {
    entries: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<R>>>>,
}

impl<R> Default for PendingRequests<R> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<R: Send> PendingRequests<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an entry; responses for `request_id` arrive on the receiver
    pub async fn register(&self, request_id: &str) -> mpsc::UnboundedReceiver<R> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.write().await.insert(request_id.to_string(), tx);
        rx
    }

    /// Deliver a response. Returns false when nobody is waiting for it.
    pub async fn resolve(&self, request_id: &str, response: R) -> bool {
        let entries = self.entries.read().await;
        match entries.get(request_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop an entry; later responses for it are unmatched
    pub async fn remove(&self, request_id: &str) {
        self.entries.write().await.remove(request_id);
    }

    /// Gather responses until `limit` have arrived or `wait` elapses, then
    /// close the entry. A `wait` too large to form a deadline never expires.
    pub async fn collect(
        &self,
        request_id: &str,
        mut rx: mpsc::UnboundedReceiver<R>,
        wait: Duration,
        limit: usize,
    ) -> Vec<R> {
        let deadline = Instant::now().checked_add(wait);
        let mut responses = Vec::new();

        while responses.len() < limit {
            let received = match deadline {
                Some(deadline) => timeout_at(deadline, rx.recv()).await.ok().flatten(),
                None => rx.recv().await,
            };
            match received {
                Some(response) => responses.push(response),
                None => break,
            }
        }

        self.remove(request_id).await;
        debug!("Request {} closed with {} responses", request_id, responses.len());
        responses
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_unknown_request() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        assert!(!pending.resolve("nope", 1).await);
    }

    #[tokio::test]
    async fn test_collect_until_limit() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let rx = pending.register("r1").await;

        assert!(pending.resolve("r1", 1).await);
        assert!(pending.resolve("r1", 2).await);

        let got = pending.collect("r1", rx, Duration::from_secs(5), 2).await;
        assert_eq!(got, vec![1, 2]);
        assert!(pending.is_empty().await);
        assert!(!pending.resolve("r1", 3).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_expires() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let rx = pending.register("r1").await;
        pending.resolve("r1", 7).await;

        let got = pending
            .collect("r1", rx, Duration::from_millis(100), usize::MAX)
            .await;
        assert_eq!(got, vec![7]);
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_collect_with_unbounded_wait() {
        let pending: PendingRequests<u32> = PendingRequests::new();
        let rx = pending.register("r1").await;
        pending.resolve("r1", 1).await;
        pending.resolve("r1", 2).await;

        let got = pending.collect("r1", rx, Duration::MAX, 2).await;
        assert_eq!(got, vec![1, 2]);
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_resolve() {
        let pending: Arc<PendingRequests<u32>> = Arc::new(PendingRequests::new());
        let rx = pending.register("r").await;

        let resolver = {
            let pending = pending.clone();
            tokio::spawn(async move {
                for i in 0..3 {
                    pending.resolve("r", i).await;
                }
            })
        };
        resolver.await.unwrap();

        let got = pending.collect("r", rx, Duration::from_secs(1), 3).await;
        assert_eq!(got.len(), 3);
    }
}

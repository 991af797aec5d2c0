//! NetNamespace watcher; caches namespace→VNID for the CNI path
//! (component I).
//!
//! Grounded on `original_source/ksdn/node.go`'s `nodeVNIDMap`, replacing
//! its condition-variable wait with a `tokio::sync::Notify` so `get_vnid`
//! composes with an external cancellation token instead of blocking a whole
//! OS thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::registry::{EventType, Registry};
use crate::watcher::{watch_stream, NetNamespaceSource};

/// Bound on how long `get_vnid` waits for an as-yet-unseen namespace before
/// giving up, so a typo'd namespace name doesn't hang a pod ADD forever.
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NodeVnid {
    cache: RwLock<HashMap<String, u32>>,
    changed: Notify,
}

impl NodeVnid {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn run(self: Arc<Self>, registry: Arc<dyn Registry>, network: String, cancel: CancellationToken) {
        tokio::spawn(async move {
            self.run_watcher(registry, network, cancel).await;
        });
    }

    async fn run_watcher(&self, registry: Arc<dyn Registry>, network: String, cancel: CancellationToken) {
        use futures::StreamExt;

        let source = NetNamespaceSource { registry, network };
        let mut stream = watch_stream(source);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => {
                    let Some(batch) = next else { return };
                    let mut cache = self.cache.write().await;
                    for change in batch {
                        match change.event_type {
                            EventType::Added => {
                                let Some(ns) = change.value else { continue };
                                cache.insert(ns.net_name, ns.net_id);
                            }
                            EventType::Removed => {
                                cache.remove(&change.key);
                            }
                        }
                    }
                    drop(cache);
                    self.changed.notify_waiters();
                }
            }
        }
    }

    /// Non-blocking lookup, used once a caller already knows the namespace
    /// is populated (e.g. re-reading after an `UPDATE` notification).
    pub async fn peek(&self, namespace: &str) -> Option<u32> {
        self.cache.read().await.get(namespace).copied()
    }

    /// Blocks (bounded by [`WAIT_TIMEOUT`]) until `namespace` has a cached
    /// VNID, used by PodManager's ADD path.
    pub async fn get_vnid(&self, namespace: &str) -> Option<u32> {
        if let Some(id) = self.peek(namespace).await {
            return Some(id);
        }

        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let wait = self.changed.notified();
            if let Some(id) = self.peek(namespace).await {
                return Some(id);
            }
            tokio::select! {
                _ = wait => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("timed out waiting for VNID of namespace {namespace}");
                    return None;
                }
            }
        }
    }
}

impl Default for NodeVnid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peek_returns_none_before_population() {
        let cache = NodeVnid::new();
        assert_eq!(cache.peek("default").await, None);
    }

    #[tokio::test]
    async fn peek_returns_cached_value() {
        let cache = NodeVnid::new();
        cache.cache.write().await.insert("default".to_string(), 7);
        assert_eq!(cache.peek("default").await, Some(7));
    }

    #[tokio::test]
    async fn get_vnid_wakes_on_notify() {
        let cache = Arc::new(NodeVnid::new());
        let waiter = Arc::clone(&cache);
        let handle = tokio::spawn(async move { waiter.get_vnid("default").await });

        tokio::task::yield_now().await;
        cache.cache.write().await.insert("default".to_string(), 9);
        cache.changed.notify_waiters();

        assert_eq!(handle.await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn get_vnid_times_out_on_unknown_namespace() {
        let cache = NodeVnid::new();
        let result = tokio::time::timeout(Duration::from_millis(50), async {
            tokio::select! {
                _ = cache.changed.notified() => None,
                _ = tokio::time::sleep(Duration::from_millis(10)) => cache.peek("ghost").await,
            }
        })
        .await
        .unwrap();
        assert_eq!(result, None);
    }
}

use super::FetchResult;
use futures::future::{BoxFuture, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Handle to a pending orchestrated fetch; clones share one computation.
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Registry of pending fetches keyed by normalized query key.
///
/// Entries live only for the duration of one orchestrated fetch; the
/// computation removes its own entry when it settles, success or failure.
/// A separate set guards background revalidations so at most one refresh
/// per key runs at a time.
#[derive(Default)]
pub struct InflightRegistry {
    pending: Mutex<HashMap<String, SharedFetch>>,
    refreshing: Mutex<HashSet<String>>,
}

impl InflightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join an existing pending fetch for `key`, or install `fetch` as the
    /// one computation all concurrent callers will share.
    pub async fn join_or_insert<F>(&self, key: &str, fetch: F) -> SharedFetch
    where
        F: FnOnce() -> SharedFetch,
    {
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.get(key) {
            debug!(key, "joining in-flight fetch");
            return existing.clone();
        }
        let shared = fetch();
        pending.insert(key.to_string(), shared.clone());
        shared
    }

    /// Remove the pending entry for `key`. Called unconditionally by the
    /// computation itself once it settles.
    pub async fn remove(&self, key: &str) {
        self.pending.lock().await.remove(key);
    }

    pub async fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().await.contains_key(key)
    }

    /// Try to claim the background-refresh slot for `key`.
    pub async fn begin_refresh(&self, key: &str) -> bool {
        self.refreshing.lock().await.insert(key.to_string())
    }

    /// Release the background-refresh slot for `key`.
    pub async fn end_refresh(&self, key: &str) {
        self.refreshing.lock().await.remove(key);
    }
}

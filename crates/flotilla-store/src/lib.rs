//! flotilla-store — an opaque interface over a hierarchical, strongly
//! consistent, watchable KV store with TTLs.
//!
//! The coordination protocols (leader election, table replication, minion
//! membership) are written against the [`Store`] trait and assume only
//! that `create` is linearizable and that TTLs expire. [`MemoryStore`]
//! implements the trait in-process for tests and single-node operation;
//! a binding to an external store plugs in at the same seam.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

pub use memory::MemoryStore;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store operations. `Exists` and `Missing` are part of
/// the protocol (the elector branches on `Exists`); everything else is a
/// transient fault to retry next tick.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path already exists: {0}")]
    Exists(String),

    #[error("path missing: {0}")]
    Missing(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A key/value entry below a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub value: String,
}

/// The store interface. A `ttl` of `None` means the node never expires.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key. `Ok(None)` when the path is absent or expired.
    async fn get(&self, path: &str) -> StoreResult<Option<String>>;

    /// Upsert a key.
    async fn set(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Create a key, failing with [`StoreError::Exists`] when it is
    /// already present. This is the primitive leader election leans on;
    /// the backing store must make it linearizable.
    async fn create(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Extend the TTL of an existing key and update its value. Fails with
    /// [`StoreError::Missing`] when the key is gone.
    async fn refresh(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Create a directory, failing with [`StoreError::Exists`] when
    /// present.
    async fn mkdir(&self, path: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Extend (or establish) a directory's TTL.
    async fn refresh_dir(&self, path: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// The key entries below a directory.
    async fn get_tree(&self, path: &str) -> StoreResult<Vec<Entry>>;

    /// Subscribe to changes at or below `path`. Signals are coalesced to
    /// at most one per `debounce` interval.
    fn watch(&self, path: &str, debounce: Duration) -> mpsc::Receiver<()>;
}

/// Directories the coordination protocols expect to exist.
pub const REQUIRED_DIRS: &[&str] = &["/minion", "/connections", "/containers", "/hostnames"];

const SETUP_RETRY: Duration = Duration::from_secs(5);

/// Create the required directories, retrying until the store comes up.
/// "Already exists" is not an error; it converts into a refresh.
pub async fn setup_dirs(store: &dyn Store, dirs: &[&str]) {
    for dir in dirs {
        loop {
            match store.mkdir(dir, None).await {
                Ok(()) => break,
                Err(StoreError::Exists(_)) => {
                    if let Err(err) = store.refresh_dir(dir, None).await {
                        warn!(%dir, error = %err, "failed to refresh store directory");
                    }
                    break;
                }
                Err(err) => {
                    warn!(%dir, error = %err, "store directory setup failed, retrying");
                    tokio::time::sleep(SETUP_RETRY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setup_dirs_is_idempotent() {
        let store = MemoryStore::new();
        setup_dirs(&store, REQUIRED_DIRS).await;
        setup_dirs(&store, REQUIRED_DIRS).await;

        store
            .set("/minion/nodes/10.0.0.1", "{}", None)
            .await
            .unwrap();
        let tree = store.get_tree("/minion/nodes").await.unwrap();
        assert_eq!(tree.len(), 1);
    }
}

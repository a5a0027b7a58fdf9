//! In-memory store backend.
//!
//! Single-process implementation of [`Store`]: a flat map of paths with
//! lazily enforced TTLs (an expired node reads as missing) and prefix
//! watchers. `create` is linearizable within the process because every
//! operation serializes on one lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::{Entry, Store, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Node {
    value: String,
    dir: bool,
    expires_at: Option<Instant>,
}

impl Node {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    watchers: Vec<(String, Weak<Notify>)>,
}

/// An in-process [`Store`]. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expires(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|d| Instant::now() + d)
    }

    fn notify(inner: &mut Inner, path: &str) {
        inner.watchers.retain(|(prefix, notify)| {
            let Some(notify) = notify.upgrade() else {
                return false;
            };
            if path.starts_with(prefix.as_str()) {
                notify.notify_one();
            }
            true
        });
    }

    fn put(&self, path: &str, node: Node) {
        let mut inner = self.lock();
        let changed = match inner.nodes.get(path) {
            Some(old) => !old.live() || old.value != node.value || old.dir != node.dir,
            None => true,
        };
        inner.nodes.insert(path.to_string(), node);
        if changed {
            Self::notify(&mut inner, path);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str) -> StoreResult<Option<String>> {
        let inner = self.lock();
        Ok(inner
            .nodes
            .get(path)
            .filter(|n| n.live() && !n.dir)
            .map(|n| n.value.clone()))
    }

    async fn set(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.put(
            path,
            Node {
                value: value.to_string(),
                dir: false,
                expires_at: Self::expires(ttl),
            },
        );
        Ok(())
    }

    async fn create(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        {
            let inner = self.lock();
            if inner.nodes.get(path).is_some_and(Node::live) {
                return Err(StoreError::Exists(path.to_string()));
            }
        }
        self.put(
            path,
            Node {
                value: value.to_string(),
                dir: false,
                expires_at: Self::expires(ttl),
            },
        );
        Ok(())
    }

    async fn refresh(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        {
            let inner = self.lock();
            if !inner.nodes.get(path).is_some_and(Node::live) {
                return Err(StoreError::Missing(path.to_string()));
            }
        }
        self.put(
            path,
            Node {
                value: value.to_string(),
                dir: false,
                expires_at: Self::expires(ttl),
            },
        );
        Ok(())
    }

    async fn mkdir(&self, path: &str, ttl: Option<Duration>) -> StoreResult<()> {
        {
            let inner = self.lock();
            if inner.nodes.get(path).is_some_and(Node::live) {
                return Err(StoreError::Exists(path.to_string()));
            }
        }
        self.put(
            path,
            Node {
                value: String::new(),
                dir: true,
                expires_at: Self::expires(ttl),
            },
        );
        Ok(())
    }

    async fn refresh_dir(&self, path: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.put(
            path,
            Node {
                value: String::new(),
                dir: true,
                expires_at: Self::expires(ttl),
            },
        );
        Ok(())
    }

    async fn get_tree(&self, path: &str) -> StoreResult<Vec<Entry>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let inner = self.lock();
        Ok(inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(_, n)| n.live() && !n.dir)
            .map(|(p, n)| Entry {
                path: p.clone(),
                value: n.value.clone(),
            })
            .collect())
    }

    fn watch(&self, path: &str, debounce: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let notify = Arc::new(Notify::new());
        self.lock()
            .watchers
            .push((path.to_string(), Arc::downgrade(&notify)));

        tokio::spawn(async move {
            loop {
                notify.notified().await;
                if tx.send(()).await.is_err() {
                    break;
                }
                tokio::time::sleep(debounce).await;
            }
        });

        rx
    }
}

//! The container runtime seam.
//!
//! The real runtime client lives outside this repository; everything here
//! is written against [`ContainerRuntime`]. [`MemoryRuntime`] is the
//! in-process implementation used by tests and single-node development.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("runtime error: {0}")]
    Failed(String),
}

/// A container as the runtime reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub pid: u32,
}

/// Everything needed to start a container.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Optional fixed name; the runtime invents one when empty.
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: String,
    pub privileged: bool,
    pub volumes_from: Vec<String>,
}

/// The capability set the minion needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> RuntimeResult<()>;

    /// Start a container, returning its runtime ID.
    async fn run(&self, opts: RunOptions) -> RuntimeResult<String>;

    async fn get(&self, id: &str) -> RuntimeResult<RuntimeContainer>;

    /// Running containers, optionally filtered to one label pair.
    async fn list(&self, label: Option<(&str, &str)>) -> RuntimeResult<Vec<RuntimeContainer>>;

    /// Remove a container by name. Removing an absent name fails with
    /// [`RuntimeError::NoSuchContainer`].
    async fn remove(&self, name: &str) -> RuntimeResult<()>;

    /// Remove a container by runtime ID.
    async fn remove_id(&self, id: &str) -> RuntimeResult<()>;

    async fn is_running(&self, name: &str) -> RuntimeResult<bool>;

    async fn exec(&self, name: &str, command: &[&str]) -> RuntimeResult<()>;

    /// Build an image from a Dockerfile, returning the image ID.
    async fn build(&self, name: &str, dockerfile: &str) -> RuntimeResult<String>;

    async fn push(&self, registry: &str, image: &str) -> RuntimeResult<()>;
}

#[derive(Default)]
struct MemoryState {
    containers: BTreeMap<String, RuntimeContainer>,
    counter: u32,
    execs: Vec<(String, Vec<String>)>,
    built: BTreeMap<String, String>,
    pushes: Vec<(String, String)>,
    pulls: Vec<String>,
}

/// An in-process [`ContainerRuntime`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryRuntime {
    pub fn new() -> MemoryRuntime {
        MemoryRuntime::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of containers currently running.
    pub fn running(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Recorded `exec` invocations as (container, command) pairs.
    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.lock().execs.clone()
    }

    /// Recorded pushes as (registry, image) pairs.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.lock().pushes.clone()
    }

    /// Images pulled so far.
    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    /// Images built so far, as name → Dockerfile.
    pub fn built(&self) -> BTreeMap<String, String> {
        self.lock().built.clone()
    }

    pub fn container(&self, name: &str) -> Option<RuntimeContainer> {
        self.lock().containers.get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        self.lock().pulls.push(image.to_string());
        Ok(())
    }

    async fn run(&self, opts: RunOptions) -> RuntimeResult<String> {
        let mut state = self.lock();
        state.counter += 1;
        let n = state.counter;

        let name = if opts.name.is_empty() {
            format!("c-{n}")
        } else {
            opts.name.clone()
        };
        if state.containers.contains_key(&name) {
            return Err(RuntimeError::Failed(format!(
                "container name already in use: {name}"
            )));
        }

        let container = RuntimeContainer {
            id: format!("cid-{n}"),
            name: name.clone(),
            image: opts.image,
            command: opts.args,
            env: opts.env,
            labels: opts.labels,
            pid: 1000 + n,
        };
        let id = container.id.clone();
        state.containers.insert(name, container);
        Ok(id)
    }

    async fn get(&self, id: &str) -> RuntimeResult<RuntimeContainer> {
        self.lock()
            .containers
            .values()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))
    }

    async fn list(&self, label: Option<(&str, &str)>) -> RuntimeResult<Vec<RuntimeContainer>> {
        let state = self.lock();
        Ok(state
            .containers
            .values()
            .filter(|c| match label {
                Some((key, value)) => c.labels.get(key).map(String::as_str) == Some(value),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        match self.lock().containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NoSuchContainer(name.to_string())),
        }
    }

    async fn remove_id(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.lock();
        let name = state
            .containers
            .values()
            .find(|c| c.id == id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        state.containers.remove(&name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> RuntimeResult<bool> {
        Ok(self.lock().containers.contains_key(name))
    }

    async fn exec(&self, name: &str, command: &[&str]) -> RuntimeResult<()> {
        let mut state = self.lock();
        if !state.containers.contains_key(name) {
            return Err(RuntimeError::NoSuchContainer(name.to_string()));
        }
        state.execs.push((
            name.to_string(),
            command.iter().map(|s| s.to_string()).collect(),
        ));
        Ok(())
    }

    async fn build(&self, name: &str, dockerfile: &str) -> RuntimeResult<String> {
        let mut state = self.lock();
        state.counter += 1;
        let id = format!("img-{}", state.counter);
        state.built.insert(name.to_string(), dockerfile.to_string());
        Ok(id)
    }

    async fn push(&self, registry: &str, image: &str) -> RuntimeResult<()> {
        self.lock()
            .pushes
            .push((registry.to_string(), image.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_get_remove_cycle() {
        let rt = MemoryRuntime::new();
        let id = rt
            .run(RunOptions {
                name: "etcd".into(),
                image: "quay.io/coreos/etcd".into(),
                ..RunOptions::default()
            })
            .await
            .unwrap();

        assert!(rt.is_running("etcd").await.unwrap());
        let c = rt.get(&id).await.unwrap();
        assert_eq!(c.name, "etcd");
        assert!(c.pid > 0);

        rt.remove("etcd").await.unwrap();
        assert!(!rt.is_running("etcd").await.unwrap());
        assert!(matches!(
            rt.remove("etcd").await,
            Err(RuntimeError::NoSuchContainer(_))
        ));
    }

    #[tokio::test]
    async fn anonymous_containers_get_names() {
        let rt = MemoryRuntime::new();
        let id1 = rt
            .run(RunOptions {
                image: "nginx".into(),
                ..RunOptions::default()
            })
            .await
            .unwrap();
        let id2 = rt
            .run(RunOptions {
                image: "nginx".into(),
                ..RunOptions::default()
            })
            .await
            .unwrap();

        assert_ne!(id1, id2);
        assert_eq!(rt.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let rt = MemoryRuntime::new();
        let opts = RunOptions {
            name: "etcd".into(),
            image: "etcd".into(),
            ..RunOptions::default()
        };
        rt.run(opts.clone()).await.unwrap();
        assert!(rt.run(opts).await.is_err());
    }

    #[tokio::test]
    async fn pulls_and_builds_are_recorded() {
        let rt = MemoryRuntime::new();
        rt.pull("quay.io/coreos/etcd:v3.3").await.unwrap();
        let id = rt.build("localhost:5000/app", "FROM alpine").await.unwrap();

        assert_eq!(rt.pulls(), vec!["quay.io/coreos/etcd:v3.3"]);
        assert_eq!(
            rt.built().get("localhost:5000/app").map(String::as_str),
            Some("FROM alpine")
        );
        assert!(id.starts_with("img-"));
    }

    #[tokio::test]
    async fn list_filters_by_label() {
        let rt = MemoryRuntime::new();
        let mut labels = BTreeMap::new();
        labels.insert("flotilla".to_string(), "scheduler".to_string());
        rt.run(RunOptions {
            image: "app".into(),
            labels,
            ..RunOptions::default()
        })
        .await
        .unwrap();
        rt.run(RunOptions {
            name: "system".into(),
            image: "etcd".into(),
            ..RunOptions::default()
        })
        .await
        .unwrap();

        let filtered = rt
            .list(Some(("flotilla", "scheduler")))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].image, "app");
    }
}

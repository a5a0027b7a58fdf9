//! The capability set a cloud provider must offer.
//!
//! `list` is the source of truth for cloud state; the reconciler never
//! caches it across cycles. Provider SDK bindings live outside this
//! repository and plug in through the [`Factory`] seam; the in-memory
//! [`MockCloud`](crate::MockCloud) backs tests and single-node runs.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use flotilla_db::Provider;

use crate::machine::{Acl, CloudMachine};
use crate::MockCloud;

pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("no client for provider {0}")]
    Unsupported(Provider),

    #[error("provider error: {0}")]
    Provider(String),
}

/// One provider in one region, scoped to a namespace.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// The machines currently running under this client's namespace.
    async fn list(&self) -> CloudResult<Vec<CloudMachine>>;

    /// Boot the described machines. IDs and IPs appear in later `list`s.
    async fn boot(&self, machines: Vec<CloudMachine>) -> CloudResult<()>;

    /// Terminate the given machines.
    async fn stop(&self, machines: Vec<CloudMachine>) -> CloudResult<()>;

    /// Replace the firewall rules for this namespace.
    async fn set_acls(&self, acls: Vec<Acl>) -> CloudResult<()>;

    /// Assign (or clear) the floating IPs recorded on the given machines.
    async fn update_floating_ips(&self, machines: Vec<CloudMachine>) -> CloudResult<()>;
}

/// Builds a client for a (provider, namespace, region) triple.
pub type Factory =
    Arc<dyn Fn(Provider, &str, &str) -> CloudResult<Arc<dyn CloudClient>> + Send + Sync>;

/// The factory wired into the daemon: mock in-process machines, with SDK
/// bindings joining through the same seam when linked in.
pub fn default_factory() -> Factory {
    Arc::new(
        |provider: Provider, namespace: &str, region: &str| -> CloudResult<Arc<dyn CloudClient>> {
            match provider {
                Provider::Mock => Ok(Arc::new(MockCloud::new(namespace, region))),
                other => Err(CloudError::Unsupported(other)),
            }
        },
    )
}

//! An in-memory cloud.
//!
//! Boots are instant, IDs are sequential, and every request is recorded
//! so tests can assert exactly which calls a reconciliation cycle made.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::machine::{Acl, CloudMachine};
use crate::provider::{CloudClient, CloudResult};

#[derive(Default)]
struct MockState {
    machines: BTreeMap<String, CloudMachine>,
    counter: u32,
    boots: Vec<CloudMachine>,
    stops: Vec<String>,
    ip_updates: Vec<CloudMachine>,
    acls: Vec<Acl>,
}

/// In-memory [`CloudClient`]. Clones share state, so a test can hold one
/// handle while the reconciler drives another.
#[derive(Clone)]
pub struct MockCloud {
    namespace: String,
    region: String,
    inner: Arc<Mutex<MockState>>,
}

impl MockCloud {
    pub fn new(namespace: impl Into<String>, region: impl Into<String>) -> MockCloud {
        MockCloud {
            namespace: namespace.into(),
            region: region.into(),
            inner: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Boot requests recorded since the last [`Self::clear_log`].
    pub fn boots(&self) -> Vec<CloudMachine> {
        self.lock().boots.clone()
    }

    /// IDs of machines stopped since the last [`Self::clear_log`].
    pub fn stops(&self) -> Vec<String> {
        self.lock().stops.clone()
    }

    pub fn ip_updates(&self) -> Vec<CloudMachine> {
        self.lock().ip_updates.clone()
    }

    /// The firewall rules most recently set.
    pub fn acls(&self) -> Vec<Acl> {
        self.lock().acls.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.boots.clear();
        state.stops.clear();
        state.ip_updates.clear();
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    async fn list(&self) -> CloudResult<Vec<CloudMachine>> {
        Ok(self.lock().machines.values().cloned().collect())
    }

    async fn boot(&self, machines: Vec<CloudMachine>) -> CloudResult<()> {
        let mut state = self.lock();
        for mut m in machines {
            state.counter += 1;
            let n = state.counter;
            m.id = format!("{}-{}-{}", self.namespace, self.region, n);
            if m.public_ip.is_empty() {
                m.public_ip = format!("203.0.113.{n}");
            }
            if m.private_ip.is_empty() {
                m.private_ip = format!("10.0.0.{n}");
            }
            state.boots.push(m.clone());
            state.machines.insert(m.id.clone(), m);
        }
        Ok(())
    }

    async fn stop(&self, machines: Vec<CloudMachine>) -> CloudResult<()> {
        let mut state = self.lock();
        for m in machines {
            state.machines.remove(&m.id);
            state.stops.push(m.id);
        }
        Ok(())
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> CloudResult<()> {
        self.lock().acls = acls;
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<CloudMachine>) -> CloudResult<()> {
        let mut state = self.lock();
        for m in machines {
            state.ip_updates.push(m.clone());
            if let Some(existing) = state.machines.get_mut(&m.id) {
                existing.floating_ip = m.floating_ip;
            }
        }
        Ok(())
    }
}

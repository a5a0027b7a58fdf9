//! flotilla-minion — the agent running on each cluster machine.
//!
//! A minion is a small database plus a set of loops keyed off its role:
//!
//! - [`server`]: the gRPC surface the foreman configures this node over.
//! - [`supervisor`]: keeps the system containers running (coordination
//!   store, overlay daemons, registry).
//! - [`scheduler`]: master side assigns containers to workers; worker
//!   side converges the local runtime on its assignments.
//! - [`network`]: leader-only overlay programming (address sets, ACLs,
//!   virtual IPs).
//! - [`registry`]: leader-only custom image builds.
//! - [`keys`]: mirrors authorized SSH keys to disk.
//!
//! Election, table replication, and membership come from `flotilla-sync`;
//! the leader additionally compiles the blueprint it was handed into
//! desired Container/Label/Connection/Placement rows.

pub mod keys;
pub mod network;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

use flotilla_db::{Callback, Cause, Conn, Minion, Role, TableKind, TableSet};
use flotilla_store::Store;

use crate::network::OverlayClient;
use crate::runtime::ContainerRuntime;

/// Startup parameters for a minion process.
pub struct MinionOptions {
    pub role: Role,
    pub port: u16,
    pub authorized_keys_path: PathBuf,
}

impl Default for MinionOptions {
    fn default() -> Self {
        MinionOptions {
            role: Role::None,
            port: server::MINION_PORT,
            authorized_keys_path: PathBuf::from("/home/flotilla/.ssh/authorized_keys"),
        }
    }
}

/// Run the minion. Blocks until shutdown is signaled.
pub async fn run(
    conn: Conn,
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    overlay: Arc<dyn OverlayClient>,
    options: MinionOptions,
    shutdown: watch::Receiver<bool>,
) {
    conn.txn(TableSet::of(&[TableKind::Minion]), |view| {
        let mut own = view.insert::<Minion>();
        own.role = options.role;
        own.self_node = true;
        view.commit(own);
    });

    flotilla_store::setup_dirs(store.as_ref(), flotilla_store::REQUIRED_DIRS).await;

    tokio::spawn(server::serve(conn.clone(), options.port, shutdown.clone()));
    tokio::spawn(supervisor::run(
        conn.clone(),
        runtime.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(scheduler::run(
        conn.clone(),
        runtime.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(network::run(conn.clone(), overlay, shutdown.clone()));
    tokio::spawn(registry::run(conn.clone(), runtime, shutdown.clone()));
    tokio::spawn(keys::run(
        conn.clone(),
        options.authorized_keys_path.clone(),
        shutdown.clone(),
    ));

    flotilla_sync::run_election(conn.clone(), store.clone()).await;
    flotilla_sync::run_replication(conn.clone(), store.clone());

    conn.register_callback(
        "policy",
        0,
        TableSet::of(&[TableKind::Minion, TableKind::Etcd]),
        PolicyCallback { conn: conn.clone() },
    );

    flotilla_sync::run_membership(conn, store, shutdown).await;
}

struct PolicyCallback {
    conn: Conn,
}

#[async_trait]
impl Callback for PolicyCallback {
    async fn on_cause(&mut self, _cause: Cause) {
        apply_policy(&self.conn);
    }
}

/// On the leader, compile the blueprint the foreman pushed into desired
/// state rows for the whole cluster.
pub fn apply_policy(conn: &Conn) {
    conn.txn(
        TableSet::of(&[
            TableKind::Minion,
            TableKind::Etcd,
            TableKind::Container,
            TableKind::Connection,
            TableKind::Label,
            TableKind::Placement,
            TableKind::Image,
        ]),
        |view| {
            let Ok(own) = view.minion_self() else {
                return;
            };
            if own.blueprint.is_empty() || !view.etcd_leader() {
                return;
            }
            if let Err(err) = flotilla_engine::update_policy(view, &own.blueprint) {
                warn!(error = %err, "failed to apply blueprint policy");
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_db::{Container, Etcd};

    fn leader_with_blueprint(blueprint: &str) -> Conn {
        let conn = Conn::new();
        conn.txn(TableSet::of(&[TableKind::Minion, TableKind::Etcd]), |view| {
            let mut own = view.insert::<Minion>();
            own.role = Role::Master;
            own.self_node = true;
            own.blueprint = blueprint.into();
            view.commit(own);

            let mut etcd = view.insert::<Etcd>();
            etcd.leader = true;
            view.commit(etcd);
        });
        conn
    }

    #[test]
    fn leader_applies_blueprint_policy() {
        let blueprint = r#"{
            "Namespace": "ns",
            "Containers": [{"ID": "abc", "Image": "nginx"}],
            "Labels": [{"Name": "web", "IDs": ["abc"]}],
            "Connections": [{"From": "web", "To": "web", "MinPort": 80, "MaxPort": 80}]
        }"#;
        let conn = leader_with_blueprint(blueprint);

        apply_policy(&conn);

        let containers = conn.select::<Container>(|_| true);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].image, "nginx");
        assert_eq!(containers[0].labels, vec!["web"]);
    }

    #[test]
    fn followers_do_not_apply_policy() {
        let conn = leader_with_blueprint(r#"{"Namespace": "ns", "Containers": [{"ID": "abc", "Image": "nginx"}]}"#);
        conn.txn(TableSet::of(&[TableKind::Etcd]), |view| {
            let mut etcd = view.rows::<Etcd>().remove(0);
            etcd.leader = false;
            view.commit(etcd);
        });

        apply_policy(&conn);
        assert!(conn.select::<Container>(|_| true).is_empty());
    }
}

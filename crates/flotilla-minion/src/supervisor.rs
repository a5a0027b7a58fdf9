//! The system-container supervisor.
//!
//! Keeps the infrastructure containers that support the application
//! running on every node: the coordination store, the overlay network
//! daemons, the container orchestration sidecars, and on masters the
//! image registry. The rule is remove-then-run: whenever an argument, the
//! role, or the peer set changes from what was last applied, the affected
//! container is removed and started fresh.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use flotilla_db::{Conn, Etcd, Role, TableKind, TableSet};

use crate::runtime::{ContainerRuntime, RunOptions, RuntimeError};

pub const ETCD: &str = "etcd";
pub const OVN_CONTROLLER: &str = "ovn-controller";
pub const OVN_NORTHD: &str = "ovn-northd";
pub const OVSDB: &str = "ovsdb-server";
pub const VSWITCHD: &str = "ovs-vswitchd";
pub const SWARM: &str = "swarm";
pub const REGISTRY: &str = "registry";

const ALL_CONTAINERS: [&str; 7] = [
    ETCD,
    OVN_CONTROLLER,
    OVN_NORTHD,
    OVSDB,
    VSWITCHD,
    SWARM,
    REGISTRY,
];

const OVS_IMAGE: &str = "flotilla/ovs";
const ETCD_HEARTBEAT_INTERVAL: &str = "500";
const ETCD_ELECTION_TIMEOUT: &str = "5000";

fn image_for(name: &str) -> &'static str {
    match name {
        ETCD => "quay.io/coreos/etcd:v3.3",
        SWARM => "swarm:1.2.9",
        REGISTRY => "registry:2",
        _ => OVS_IMAGE,
    }
}

/// What was last successfully applied; a change in any field forces the
/// affected containers to restart.
#[derive(Debug, Clone, Default, PartialEq)]
struct Applied {
    role: Role,
    etcd_ips: Vec<String>,
    leader_ip: String,
    private_ip: String,
    public_ip: String,
    leader: bool,
    provider: String,
    region: String,
    size: String,
}

pub struct Supervisor {
    conn: Conn,
    runtime: Arc<dyn ContainerRuntime>,
    applied: Applied,
}

impl Supervisor {
    pub fn new(conn: Conn, runtime: Arc<dyn ContainerRuntime>) -> Supervisor {
        Supervisor {
            conn,
            runtime,
            applied: Applied::default(),
        }
    }

    /// Apply the current Minion/Etcd state to the system containers.
    pub async fn run_once(&mut self) {
        let minion = match self.conn.minion_self() {
            Ok(minion) => minion,
            Err(_) => return,
        };
        let etcd = self
            .conn
            .select::<Etcd>(|_| true)
            .into_iter()
            .next()
            .unwrap_or_default();

        let desired = Applied {
            role: minion.role,
            etcd_ips: etcd.etcd_ips.clone(),
            leader_ip: etcd.leader_ip.clone(),
            private_ip: minion.private_ip.clone(),
            public_ip: minion.public_ip.clone(),
            leader: etcd.leader,
            provider: minion.provider.clone(),
            region: minion.region.clone(),
            size: minion.size.clone(),
        };
        if desired == self.applied {
            return;
        }

        if desired.role != self.applied.role {
            self.remove_all().await;
        }

        match desired.role {
            Role::Master => {
                self.update_master(
                    &desired.public_ip,
                    &desired.private_ip,
                    &desired.etcd_ips,
                    desired.leader,
                )
                .await
            }
            Role::Worker => {
                self.update_worker(&desired.public_ip, &desired.leader_ip, &desired.etcd_ips)
                    .await
            }
            Role::None => {}
        }

        self.applied = desired;
    }

    async fn update_master(
        &mut self,
        public_ip: &str,
        private_ip: &str,
        etcd_ips: &[String],
        leader: bool,
    ) {
        if self.applied.public_ip != public_ip || self.applied.etcd_ips != etcd_ips {
            self.remove(ETCD).await;
        }
        if self.applied.private_ip != private_ip {
            self.remove(SWARM).await;
        }

        if private_ip.is_empty() || public_ip.is_empty() || etcd_ips.is_empty() {
            return;
        }

        self.run(
            ETCD,
            &[
                &format!("--name=master-{public_ip}"),
                &format!("--initial-cluster={}", initial_cluster_string(etcd_ips)),
                &format!("--advertise-client-urls=http://{public_ip}:2379"),
                &format!("--initial-advertise-peer-urls=http://{public_ip}:2380"),
                "--listen-peer-urls=http://0.0.0.0:2380",
                "--listen-client-urls=http://0.0.0.0:2379",
                &format!("--heartbeat-interval={ETCD_HEARTBEAT_INTERVAL}"),
                "--initial-cluster-state=new",
                &format!("--election-timeout={ETCD_ELECTION_TIMEOUT}"),
            ],
        )
        .await;

        self.run(OVSDB, &["ovsdb-server"]).await;
        self.run(REGISTRY, &[]).await;

        let swarm_addr = format!("{private_ip}:2377");
        self.run(
            SWARM,
            &[
                "manage",
                "--replication",
                &format!("--addr={swarm_addr}"),
                &format!("--host={swarm_addr}"),
                "etcd://127.0.0.1:2379",
            ],
        )
        .await;

        if leader {
            self.run(OVN_NORTHD, &["ovn-northd"]).await;
        } else {
            self.remove(OVN_NORTHD).await;
        }
    }

    async fn update_worker(&mut self, public_ip: &str, leader_ip: &str, etcd_ips: &[String]) {
        if self.applied.etcd_ips != etcd_ips {
            self.remove(ETCD).await;
        }
        if self.applied.leader_ip != leader_ip || self.applied.public_ip != public_ip {
            self.remove(SWARM).await;
        }

        self.run(
            ETCD,
            &[
                &format!("--initial-cluster={}", initial_cluster_string(etcd_ips)),
                &format!("--heartbeat-interval={ETCD_HEARTBEAT_INTERVAL}"),
                &format!("--election-timeout={ETCD_ELECTION_TIMEOUT}"),
                "--proxy=on",
            ],
        )
        .await;

        self.run(OVSDB, &["ovsdb-server"]).await;
        self.run(VSWITCHD, &["ovs-vswitchd"]).await;

        if leader_ip.is_empty() || public_ip.is_empty() {
            return;
        }

        self.run(
            SWARM,
            &[
                "join",
                &format!("--addr={public_ip}:2375"),
                "etcd://127.0.0.1:2379",
            ],
        )
        .await;

        let err = self
            .runtime
            .exec(
                VSWITCHD,
                &[
                    "ovs-vsctl",
                    "set",
                    "Open_vSwitch",
                    ".",
                    &format!("external_ids:ovn-remote=\"tcp:{leader_ip}:6640\""),
                    &format!("external_ids:ovn-encap-ip={public_ip}"),
                    "external_ids:ovn-encap-type=\"geneve\"",
                    &format!("external_ids:system-id=\"{public_ip}\""),
                    "--",
                    "add-br",
                    "flotilla-int",
                    "--",
                    "set",
                    "bridge",
                    "flotilla-int",
                    "fail_mode=secure",
                ],
            )
            .await;
        if let Err(err) = err {
            warn!(container = VSWITCHD, error = %err, "failed to configure overlay tunnel");
        }

        // The ovn controller cannot pick up a new remote mid-run, so it
        // restarts whenever the leader moves.
        self.remove(OVN_CONTROLLER).await;
        self.run(OVN_CONTROLLER, &["ovn-controller"]).await;
    }

    async fn run(&self, name: &str, args: &[&str]) {
        match self.runtime.is_running(name).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                warn!(container = name, error = %err, "could not check container status");
                return;
            }
        }

        let mut opts = RunOptions {
            name: name.to_string(),
            image: image_for(name).to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            network_mode: "host".to_string(),
            ..RunOptions::default()
        };
        match name {
            VSWITCHD => {
                opts.privileged = true;
                opts.volumes_from = vec![OVSDB.to_string()];
            }
            OVN_NORTHD | OVN_CONTROLLER => {
                opts.volumes_from = vec![OVSDB.to_string()];
            }
            _ => {}
        }

        info!(container = name, "starting system container");
        if let Err(err) = self.runtime.run(opts).await {
            warn!(container = name, error = %err, "failed to start system container");
        }
    }

    async fn remove(&self, name: &str) {
        match self.runtime.remove(name).await {
            Ok(()) => info!(container = name, "removed system container"),
            Err(RuntimeError::NoSuchContainer(_)) => {}
            Err(err) => {
                warn!(container = name, error = %err, "failed to remove system container")
            }
        }
    }

    async fn remove_all(&self) {
        for name in ALL_CONTAINERS {
            self.remove(name).await;
        }
    }
}

/// The supervisor loop: pull images up front, then re-apply on every
/// Minion or Etcd change.
pub async fn run(
    conn: Conn,
    runtime: Arc<dyn ContainerRuntime>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut images: Vec<&str> = ALL_CONTAINERS.iter().map(|n| image_for(n)).collect();
    images.sort_unstable();
    images.dedup();
    for image in images {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if let Err(err) = runtime.pull(image).await {
                warn!(%image, error = %err, "image pull failed");
            }
        });
    }

    let mut supervisor = Supervisor::new(conn.clone(), runtime);
    let mut trigger = conn.trigger(TableSet::of(&[TableKind::Minion, TableKind::Etcd]));
    loop {
        supervisor.run_once().await;
        tokio::select! {
            cause = trigger.recv() => {
                if cause.is_none() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// The `--initial-cluster` argument: `master-<ip>=http://<ip>:2380,...`
fn initial_cluster_string(etcd_ips: &[String]) -> String {
    etcd_ips
        .iter()
        .map(|ip| format!("master-{ip}=http://{ip}:2380"))
        .collect::<Vec<String>>()
        .join(",")
}

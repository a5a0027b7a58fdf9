//! flotilla-foreman — keeps every minion configured.
//!
//! The foreman maintains one RPC channel per machine with a public IP.
//! On every change to the Machine table it reads each minion's current
//! configuration back (role and version) and pushes the desired
//! configuration: role, addresses, blueprint, the sorted set of master
//! IPs that parameterize the minion's etcd container, and the daemon
//! version. A minion reporting a different version is marked
//! disconnected and left alone until versions match again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_db::{Cluster, Conn, Machine, Role, TableKind, TableSet};
use flotilla_proto::minion_client::MinionClient as RpcClient;
use flotilla_proto::{ConfigRequest, MinionConfig, VERSION};

/// The per-minion channel the foreman speaks over. The gRPC
/// implementation is [`GrpcDialer`]; tests substitute fakes.
#[async_trait]
pub trait MinionClient: Send + Sync {
    async fn set_minion(&self, config: MinionConfig) -> anyhow::Result<()>;
    async fn get_minion(&self) -> anyhow::Result<MinionConfig>;
}

/// Opens a [`MinionClient`] to a given IP. Dialing is lazy: a machine
/// gets a channel the first time it appears with a public IP.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ip: &str) -> anyhow::Result<Box<dyn MinionClient>>;
}

/// Dials the minion gRPC server.
pub struct GrpcDialer {
    pub port: u16,
}

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(&self, ip: &str) -> anyhow::Result<Box<dyn MinionClient>> {
        let client = RpcClient::connect(format!("http://{ip}:{}", self.port)).await?;
        Ok(Box::new(GrpcMinionClient {
            client: tokio::sync::Mutex::new(client),
        }))
    }
}

struct GrpcMinionClient {
    client: tokio::sync::Mutex<RpcClient<tonic::transport::Channel>>,
}

#[async_trait]
impl MinionClient for GrpcMinionClient {
    async fn set_minion(&self, config: MinionConfig) -> anyhow::Result<()> {
        self.client.lock().await.set_minion_config(config).await?;
        Ok(())
    }

    async fn get_minion(&self) -> anyhow::Result<MinionConfig> {
        let reply = self
            .client
            .lock()
            .await
            .get_minion_config(ConfigRequest {})
            .await?;
        Ok(reply.into_inner())
    }
}

struct MinionHandle {
    machine: Machine,
    client: Box<dyn MinionClient>,
}

/// Owns the minion channels for one daemon.
pub struct Foreman {
    conn: Conn,
    dialer: Arc<dyn Dialer>,
    minions: HashMap<String, MinionHandle>,
}

impl Foreman {
    pub fn new(conn: Conn, dialer: Arc<dyn Dialer>) -> Foreman {
        Foreman {
            conn,
            dialer,
            minions: HashMap::new(),
        }
    }

    /// Public IPs with an open channel; for tests and introspection.
    pub fn tracked(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.minions.keys().cloned().collect();
        ips.sort();
        ips
    }

    /// Recover the roles of already-running minions, e.g. after a daemon
    /// restart: whatever role each minion reports becomes the starting
    /// point for this foreman's view.
    pub async fn init(&mut self) {
        self.sync_channels().await;
        for handle in self.minions.values_mut() {
            if let Ok(config) = handle.client.get_minion().await {
                handle.machine.role = config.db_role();
            }
        }
    }

    /// One configuration round across all known minions.
    pub async fn run_once(&mut self) {
        self.sync_channels().await;

        let (etcd_members, blueprint) = self.conn.txn(
            TableSet::of(&[TableKind::Machine, TableKind::Cluster]),
            |view| {
                let mut members: Vec<String> = view
                    .select::<Machine>(|m| m.role == Role::Master && !m.private_ip.is_empty())
                    .into_iter()
                    .map(|m| m.private_ip)
                    .collect();
                members.sort();
                let blueprint = view.cluster().map(|c| c.blueprint).unwrap_or_default();
                (members, blueprint)
            },
        );

        let mut connected: HashMap<String, bool> = HashMap::new();
        for (ip, handle) in &mut self.minions {
            let current = match handle.client.get_minion().await {
                Ok(current) => current,
                Err(err) => {
                    debug!(%ip, error = %err, "minion unreachable");
                    connected.insert(ip.clone(), false);
                    continue;
                }
            };

            if current.version != VERSION {
                warn!(
                    %ip,
                    minion = %current.version,
                    daemon = VERSION,
                    "minion version skew, not pushing config"
                );
                connected.insert(ip.clone(), false);
                continue;
            }

            connected.insert(ip.clone(), current.db_role() == handle.machine.role);

            let desired = config_for(&handle.machine, &etcd_members, &blueprint);
            if let Err(err) = handle.client.set_minion(desired).await {
                warn!(%ip, error = %err, "failed to push minion config");
            }
        }

        self.conn
            .txn(TableSet::of(&[TableKind::Machine]), |view| {
                for m in view.rows::<Machine>() {
                    let is_connected = connected
                        .get(&m.public_ip)
                        .copied()
                        .unwrap_or(false);
                    if m.connected != is_connected {
                        let mut updated = m;
                        updated.connected = is_connected;
                        view.commit(updated);
                    }
                }
            });
    }

    /// Open channels for new machines, drop channels whose machine is
    /// gone, and refresh the desired-state snapshot each handle carries.
    async fn sync_channels(&mut self) {
        let machines = self.conn.select::<Machine>(|m| {
            !m.public_ip.is_empty() && !m.private_ip.is_empty() && !m.cloud_id.is_empty()
        });

        let live: HashMap<String, Machine> = machines
            .into_iter()
            .map(|m| (m.public_ip.clone(), m))
            .collect();

        self.minions.retain(|ip, _| {
            let keep = live.contains_key(ip);
            if !keep {
                info!(%ip, "closing channel to departed minion");
            }
            keep
        });

        for (ip, machine) in live {
            if let Some(handle) = self.minions.get_mut(&ip) {
                handle.machine = machine;
                continue;
            }
            match self.dialer.dial(&ip).await {
                Ok(client) => {
                    info!(%ip, "opened minion channel");
                    self.minions.insert(ip, MinionHandle { machine, client });
                }
                Err(err) => {
                    debug!(%ip, error = %err, "failed to dial minion");
                }
            }
        }
    }
}

fn config_for(machine: &Machine, etcd_members: &[String], blueprint: &str) -> MinionConfig {
    MinionConfig {
        role: flotilla_proto::Role::from(machine.role) as i32,
        private_ip: machine.private_ip.clone(),
        public_ip: machine.public_ip.clone(),
        blueprint: blueprint.to_string(),
        provider: machine.provider.to_string(),
        size: machine.size.clone(),
        region: machine.region.clone(),
        etcd_members: etcd_members.to_vec(),
        authorized_keys: machine.authorized_keys.clone(),
        version: VERSION.to_string(),
    }
}

/// The foreman loop: a round on every Machine or Cluster change and every
/// 30 seconds.
pub async fn run(conn: Conn, dialer: Arc<dyn Dialer>, mut shutdown: watch::Receiver<bool>) {
    let mut foreman = Foreman::new(conn.clone(), dialer);
    foreman.init().await;

    let mut trigger =
        conn.trigger_tick(30, TableSet::of(&[TableKind::Machine, TableKind::Cluster]));
    loop {
        foreman.run_once().await;
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

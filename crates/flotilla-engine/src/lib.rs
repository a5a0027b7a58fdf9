//! flotilla-engine — turns a blueprint document into desired-state rows.
//!
//! A blueprint is the JSON the policy compiler produces: machines,
//! containers, labels, connections, and placements under one namespace.
//! The daemon side reconciles the Machine and admin ACL tables from it;
//! the leader minion reconciles the container-level tables. Both sides
//! diff instead of rewrite, so rows survive across deployments whenever
//! their content does — a machine that already holds a cloud ID is never
//! traded for a fresh row that would reboot it.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use flotilla_db::{
    AclRule, Cluster, Conn, Connection, Container, Image, Label, Machine, Placement, Provider,
    Role, TableKind, TableSet, View,
};
use flotilla_join::{hash_join, score_join};

/// Upper bound on machines in one deployment.
pub const MAX_MACHINES: usize = 256;

const DEFAULT_DISK_GB: u32 = 32;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid blueprint: {0}")]
    Parse(String),

    #[error("{0}")]
    Config(String),
}

// ── The blueprint document ─────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Blueprint {
    #[serde(default)]
    pub namespace: String,
    #[serde(default, rename = "AdminACL")]
    pub admin_acl: Vec<String>,
    #[serde(default)]
    pub machines: Vec<BlueprintMachine>,
    #[serde(default)]
    pub containers: Vec<BlueprintContainer>,
    #[serde(default)]
    pub labels: Vec<BlueprintLabel>,
    #[serde(default)]
    pub connections: Vec<BlueprintConnection>,
    #[serde(default)]
    pub placements: Vec<BlueprintPlacement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlueprintMachine {
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub disk_size: u32,
    pub role: String,
    #[serde(default, rename = "FloatingIP")]
    pub floating_ip: String,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default, rename = "SSHKeys")]
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlueprintContainer {
    /// Stable fingerprint; filled with a content hash when absent.
    #[serde(default, rename = "ID")]
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub dockerfile: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlueprintLabel {
    pub name: String,
    #[serde(default, rename = "IDs")]
    pub ids: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlueprintConnection {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub min_port: u16,
    #[serde(default)]
    pub max_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlueprintPlacement {
    pub target_label: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub other_label: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub size: String,
    #[serde(default, rename = "FloatingIP")]
    pub floating_ip: String,
}

/// The region a machine lands in when the blueprint leaves it out.
pub fn default_region(provider: Provider) -> &'static str {
    match provider {
        Provider::Amazon => "us-west-1",
        Provider::Google => "us-east1-b",
        Provider::DigitalOcean => "sfo2",
        Provider::Vagrant => "vagrant",
        Provider::Mock => "mock",
    }
}

/// Parse and validate a blueprint, normalizing defaults: regions and
/// disk sizes are filled in, container IDs default to content hashes.
pub fn parse_blueprint(json: &str) -> EngineResult<Blueprint> {
    let mut blueprint: Blueprint =
        serde_json::from_str(json).map_err(|err| EngineError::Parse(err.to_string()))?;

    if blueprint.namespace.is_empty() {
        blueprint.namespace = "default".to_string();
    }

    if blueprint.machines.len() > MAX_MACHINES {
        return Err(EngineError::Config(format!(
            "cannot boot more than {MAX_MACHINES} machines"
        )));
    }
    for machine in &mut blueprint.machines {
        let provider = Provider::from_str(&machine.provider).map_err(EngineError::Config)?;
        if machine.region.is_empty() {
            machine.region = default_region(provider).to_string();
        }
        if machine.disk_size == 0 {
            machine.disk_size = DEFAULT_DISK_GB;
        }
        parse_role(&machine.role)?;
    }

    for connection in &blueprint.connections {
        if connection.min_port > connection.max_port {
            return Err(EngineError::Config(format!(
                "invalid port range: {}-{}",
                connection.min_port, connection.max_port
            )));
        }
        if connection.from == "public" && connection.to == "public" {
            return Err(EngineError::Config(
                "cannot connect public to public".to_string(),
            ));
        }
        if (connection.from == "public" || connection.to == "public")
            && connection.min_port != connection.max_port
        {
            return Err(EngineError::Config(format!(
                "public connections cannot range over ports: {}-{}",
                connection.min_port, connection.max_port
            )));
        }
    }

    for placement in &blueprint.placements {
        let constraints = [
            &placement.other_label,
            &placement.provider,
            &placement.region,
            &placement.size,
            &placement.floating_ip,
        ]
        .iter()
        .filter(|c| !c.is_empty())
        .count();
        if constraints > 1 {
            return Err(EngineError::Config(format!(
                "placement on {} has more than one constraint",
                placement.target_label
            )));
        }
    }

    for container in &blueprint.containers {
        if container.image.is_empty() {
            return Err(EngineError::Config(
                "container without an image".to_string(),
            ));
        }
    }
    fill_container_ids(&mut blueprint.containers);

    let known: Vec<&str> = blueprint.containers.iter().map(|c| c.id.as_str()).collect();
    for label in &blueprint.labels {
        for id in &label.ids {
            if !known.contains(&id.as_str()) {
                return Err(EngineError::Config(format!(
                    "label {} references unknown container {id}",
                    label.name
                )));
            }
        }
    }

    Ok(blueprint)
}

fn parse_role(role: &str) -> EngineResult<Role> {
    match role {
        "Master" => Ok(Role::Master),
        "Worker" => Ok(Role::Worker),
        other => Err(EngineError::Config(format!(
            "machine role must be Master or Worker, not {other:?}"
        ))),
    }
}

/// The content fingerprint of a container, with a counter folded in so
/// identical replicas stay distinguishable.
fn fill_container_ids(containers: &mut [BlueprintContainer]) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    for container in containers {
        if !container.id.is_empty() {
            continue;
        }

        let mut hasher = Sha256::new();
        hasher.update(container.image.as_bytes());
        hasher.update([0]);
        for part in &container.command {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        for (key, value) in &container.env {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        let count = seen.entry(digest.clone()).or_insert(0);
        *count += 1;
        container.id = if *count == 1 {
            digest
        } else {
            format!("{digest}.{count}")
        };
    }
}

/// The (provider, regions) map this blueprint spans.
pub fn regions_of(blueprint: &Blueprint) -> BTreeMap<Provider, Vec<String>> {
    let mut regions: BTreeMap<Provider, Vec<String>> = BTreeMap::new();
    for machine in &blueprint.machines {
        if let Ok(provider) = Provider::from_str(&machine.provider) {
            let list = regions.entry(provider).or_default();
            if !list.contains(&machine.region) {
                list.push(machine.region.clone());
            }
        }
    }
    for list in regions.values_mut() {
        list.sort();
    }
    regions
}

/// Validate a blueprint and install it as the cluster's desired state.
/// On error the database is untouched.
pub fn deploy(conn: &Conn, blueprint_json: &str) -> EngineResult<Blueprint> {
    let blueprint = parse_blueprint(blueprint_json)?;
    let normalized = serde_json::to_string(&blueprint)
        .map_err(|err| EngineError::Parse(err.to_string()))?;

    conn.txn(TableSet::of(&[TableKind::Cluster]), |view| {
        let mut cluster = match view.cluster() {
            Ok(cluster) => cluster,
            Err(_) => view.insert::<Cluster>(),
        };
        cluster.namespace = blueprint.namespace.clone();
        cluster.blueprint = normalized;
        cluster.regions = regions_of(&blueprint);
        view.commit(cluster);
    });

    Ok(blueprint)
}

// ── Daemon side: machines and admin ACLs ───────────────────────────

/// The engine loop: recompile desired machines whenever the cluster row
/// changes.
pub async fn run(conn: Conn, mut shutdown: watch::Receiver<bool>) {
    let mut trigger = conn.trigger(TableSet::of(&[TableKind::Cluster]));
    loop {
        run_once(&conn);
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

/// One engine pass over the cluster's blueprint.
pub fn run_once(conn: &Conn) {
    let blueprint = conn.txn(TableSet::of(&[TableKind::Cluster]), |view| {
        view.cluster().map(|c| c.blueprint).unwrap_or_default()
    });
    if blueprint.is_empty() {
        return;
    }

    let blueprint = match parse_blueprint(&blueprint) {
        Ok(blueprint) => blueprint,
        Err(err) => {
            // Deploy validates before committing, so this indicates a
            // schema change slipped a bad document in.
            warn!(error = %err, "stored blueprint does not parse");
            return;
        }
    };

    conn.txn(
        TableSet::of(&[TableKind::Machine, TableKind::AclRule]),
        |view| {
            update_machines(view, &blueprint);
            update_admin_acls(view, &blueprint);
        },
    );
}

/// Reconcile the Machine table with the blueprint's machines. Existing
/// rows keep their cloud identity whenever their shape still matches;
/// rows with a cloud ID win ties over empty ones so a deployment shrink
/// stops the machine that never booted.
fn update_machines(view: &mut View, blueprint: &Blueprint) {
    let desired: Vec<&BlueprintMachine> = blueprint.machines.iter().collect();
    let existing = view.rows::<Machine>();

    let diff = score_join(desired, existing, |want, have| {
        let provider = Provider::from_str(&want.provider).ok()?;
        let role = parse_role(&want.role).ok()?;
        if have.provider != provider
            || have.region != want.region
            || have.size != want.size
            || have.disk_size != want.disk_size
            || have.role != role
            || have.preemptible != want.preemptible
        {
            return None;
        }
        if have.cloud_id.is_empty() {
            Some(1)
        } else {
            Some(0)
        }
    });

    for (want, mut have) in diff.pairs {
        let keys = want.ssh_keys.join("\n");
        if have.floating_ip != want.floating_ip || have.authorized_keys != keys {
            have.floating_ip = want.floating_ip.clone();
            have.authorized_keys = keys;
            view.commit(have);
        }
    }

    for want in diff.lefts {
        // Validated at parse time.
        let (Ok(provider), Ok(role)) = (
            Provider::from_str(&want.provider),
            parse_role(&want.role),
        ) else {
            continue;
        };
        let mut machine = view.insert::<Machine>();
        machine.provider = provider;
        machine.region = want.region.clone();
        machine.size = want.size.clone();
        machine.disk_size = want.disk_size;
        machine.role = role;
        machine.preemptible = want.preemptible;
        machine.floating_ip = want.floating_ip.clone();
        machine.authorized_keys = want.ssh_keys.join("\n");
        view.commit(machine);
    }

    for gone in diff.rights {
        view.remove(&gone);
    }
}

fn update_admin_acls(view: &mut View, blueprint: &Blueprint) {
    let diff = hash_join(
        view.rows::<AclRule>(),
        blueprint.admin_acl.clone(),
        |rule: &AclRule| rule.cidr_ip.clone(),
        |cidr: &String| cidr.clone(),
    );

    for stale in diff.lefts {
        view.remove(&stale);
    }
    for cidr in diff.rights {
        let mut rule = view.insert::<AclRule>();
        rule.cidr_ip = cidr;
        rule.min_port = 1;
        rule.max_port = 65535;
        view.commit(rule);
    }
}

// ── Leader side: the container-level tables ────────────────────────

/// Reconcile the Container, Label, Connection, Placement, and Image
/// tables with a blueprint. Runs on the leader minion inside the
/// caller's transaction.
pub fn update_policy(view: &mut View, blueprint_json: &str) -> EngineResult<()> {
    let blueprint = parse_blueprint(blueprint_json)?;

    update_containers(view, &blueprint);
    update_labels(view, &blueprint);
    update_connections(view, &blueprint);
    update_placements(view, &blueprint);
    update_images(view, &blueprint);
    Ok(())
}

/// Label names per container ID, inverted from the blueprint's labels.
fn labels_by_container(blueprint: &Blueprint) -> HashMap<String, Vec<String>> {
    let mut by_container: HashMap<String, Vec<String>> = HashMap::new();
    for label in &blueprint.labels {
        for id in &label.ids {
            by_container
                .entry(id.clone())
                .or_default()
                .push(label.name.clone());
        }
    }
    for names in by_container.values_mut() {
        names.sort();
        names.dedup();
    }
    by_container
}

fn update_containers(view: &mut View, blueprint: &Blueprint) {
    let labels = labels_by_container(blueprint);
    let desired: Vec<&BlueprintContainer> = blueprint.containers.iter().collect();

    let diff = hash_join(
        desired,
        view.rows::<Container>(),
        |want: &&BlueprintContainer| want.id.clone(),
        |have: &Container| have.blueprint_id.clone(),
    );

    for (want, have) in diff.pairs {
        let mut updated = have.clone();
        updated.image = want.image.clone();
        updated.command = want.command.clone();
        updated.env = want.env.clone();
        updated.labels = labels.get(&want.id).cloned().unwrap_or_default();
        if updated != have {
            view.commit(updated);
        }
    }

    for want in diff.lefts {
        let mut container = view.insert::<Container>();
        container.blueprint_id = want.id.clone();
        container.image = want.image.clone();
        container.command = want.command.clone();
        container.env = want.env.clone();
        container.labels = labels.get(&want.id).cloned().unwrap_or_default();
        view.commit(container);
    }

    for gone in diff.rights {
        view.remove(&gone);
    }
}

fn update_labels(view: &mut View, blueprint: &Blueprint) {
    let diff = hash_join(
        blueprint.labels.clone(),
        view.rows::<Label>(),
        |want: &BlueprintLabel| want.name.clone(),
        |have: &Label| have.name.clone(),
    );

    for (want, have) in diff.pairs {
        let mut updated = have.clone();
        updated.annotations = want.annotations.clone();
        if updated != have {
            view.commit(updated);
        }
    }

    for want in diff.lefts {
        let mut label = view.insert::<Label>();
        label.name = want.name.clone();
        label.annotations = want.annotations.clone();
        view.commit(label);
    }

    for gone in diff.rights {
        view.remove(&gone);
    }
}

fn update_connections(view: &mut View, blueprint: &Blueprint) {
    let key = |from: &str, to: &str, min: u16, max: u16| {
        (from.to_string(), to.to_string(), min, max)
    };
    let diff = hash_join(
        blueprint.connections.clone(),
        view.rows::<Connection>(),
        |want: &BlueprintConnection| key(&want.from, &want.to, want.min_port, want.max_port),
        |have: &Connection| key(&have.from, &have.to, have.min_port, have.max_port),
    );

    for want in diff.lefts {
        let mut connection = view.insert::<Connection>();
        connection.from = want.from.clone();
        connection.to = want.to.clone();
        connection.min_port = want.min_port;
        connection.max_port = want.max_port;
        view.commit(connection);
    }

    for gone in diff.rights {
        view.remove(&gone);
    }
}

fn update_placements(view: &mut View, blueprint: &Blueprint) {
    let diff = hash_join(
        blueprint.placements.clone(),
        view.rows::<Placement>(),
        |want: &BlueprintPlacement| {
            (
                want.target_label.clone(),
                want.exclusive,
                want.other_label.clone(),
                want.provider.clone(),
                want.region.clone(),
                want.size.clone(),
                want.floating_ip.clone(),
            )
        },
        |have: &Placement| {
            (
                have.target_label.clone(),
                have.exclusive,
                have.other_label.clone(),
                have.provider.clone(),
                have.region.clone(),
                have.size.clone(),
                have.floating_ip.clone(),
            )
        },
    );

    for want in diff.lefts {
        let mut placement = view.insert::<Placement>();
        placement.target_label = want.target_label.clone();
        placement.exclusive = want.exclusive;
        placement.other_label = want.other_label.clone();
        placement.provider = want.provider.clone();
        placement.region = want.region.clone();
        placement.size = want.size.clone();
        placement.floating_ip = want.floating_ip.clone();
        view.commit(placement);
    }

    for gone in diff.rights {
        view.remove(&gone);
    }
}

fn update_images(view: &mut View, blueprint: &Blueprint) {
    let desired: Vec<&BlueprintContainer> = blueprint
        .containers
        .iter()
        .filter(|c| !c.dockerfile.is_empty())
        .collect();

    let diff = hash_join(
        desired,
        view.rows::<Image>(),
        |want: &&BlueprintContainer| (want.image.clone(), want.dockerfile.clone()),
        |have: &Image| (have.name.clone(), have.dockerfile.clone()),
    );

    for want in diff.lefts {
        let mut image = view.insert::<Image>();
        image.name = want.image.clone();
        image.dockerfile = want.dockerfile.clone();
        view.commit(image);
    }

    for gone in diff.rights {
        view.remove(&gone);
    }
}

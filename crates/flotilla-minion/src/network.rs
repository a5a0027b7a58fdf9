//! Overlay network programming.
//!
//! Runs on the leader master. Each cycle allocates virtual IPs for labels
//! and containers, publishes hostname records for the labels, and then
//! converges the overlay store on the authoritative policy: one address
//! set per label, one symmetric allow rule per connection, and a
//! priority-0 drop rule anchoring the default-deny posture. Deltas are
//! computed with hash joins against what the store currently holds, so a
//! steady state issues no calls at all.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use flotilla_db::{
    Conn, Connection, Container, Hostname, Label, Role, TableKind, TableSet, View,
};
use flotilla_join::hash_join;

/// The logical switch all ports, address sets, and rules live on.
pub const SWITCH: &str = "flotilla";

pub type OverlayResult<T> = Result<T, OverlayError>;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay store error: {0}")]
    Failed(String),
}

/// A named set of addresses, referenced from match expressions as
/// `$name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AddressSet {
    pub name: String,
    pub addresses: Vec<String>,
}

/// One access-control rule on the logical switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OverlayRule {
    pub priority: i32,
    pub direction: String,
    pub matcher: String,
    pub action: String,
}

/// The overlay network store client. The real OVSDB-speaking client is
/// external; [`MemoryOverlay`] stands in for tests and development.
#[async_trait]
pub trait OverlayClient: Send + Sync {
    async fn list_address_sets(&self, switch: &str) -> OverlayResult<Vec<AddressSet>>;
    async fn create_address_set(&self, switch: &str, set: AddressSet) -> OverlayResult<()>;
    async fn delete_address_set(&self, switch: &str, name: &str) -> OverlayResult<()>;

    async fn list_rules(&self, switch: &str) -> OverlayResult<Vec<OverlayRule>>;
    async fn create_rule(&self, switch: &str, rule: OverlayRule) -> OverlayResult<()>;
    async fn delete_rule(&self, switch: &str, rule: &OverlayRule) -> OverlayResult<()>;
}

/// The network loop: converge on every policy or membership change.
pub async fn run(
    conn: Conn,
    overlay: Arc<dyn OverlayClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut trigger = conn.trigger_tick(
        30,
        TableSet::of(&[
            TableKind::Container,
            TableKind::Connection,
            TableKind::Label,
            TableKind::Etcd,
            TableKind::Minion,
        ]),
    );

    loop {
        let is_leader_master = matches!(
            conn.minion_self(),
            Ok(own) if own.role == Role::Master
        ) && conn.etcd_leader();
        if is_leader_master {
            run_once(&conn, overlay.as_ref()).await;
        }

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

/// One convergence cycle.
pub async fn run_once(conn: &Conn, overlay: &dyn OverlayClient) {
    let (labels, connections) = conn.txn(
        TableSet::of(&[
            TableKind::Container,
            TableKind::Label,
            TableKind::Connection,
            TableKind::Hostname,
        ]),
        |view| {
            update_virtual_ips(view);
            let labels = view.rows::<Label>();
            sync_hostnames(view, &labels);
            (labels, view.rows::<Connection>())
        },
    );

    sync_address_sets(overlay, &labels).await;
    sync_rules(overlay, &connections).await;
}

/// Assign virtual IPs to labels and containers that lack one, derive
/// container MACs, and refresh each label's member address list.
fn update_virtual_ips(view: &mut View) {
    let labels = view.rows::<Label>();
    let containers = view.rows::<Container>();
    let mut in_use: HashSet<u32> = labels
        .iter()
        .map(|l| l.ip.as_str())
        .chain(containers.iter().map(|c| c.ip.as_str()))
        .filter_map(parse_ip)
        .collect();

    for mut label in view.rows::<Label>() {
        if label.ip.is_empty() {
            match allocate_ip(&mut in_use, &label.name) {
                Some(ip) => {
                    label.ip = ip;
                    view.commit(label);
                }
                None => warn!(label = %label.name, "virtual IP pool exhausted"),
            }
        }
    }

    for mut container in view.rows::<Container>() {
        if container.ip.is_empty() {
            let key = if container.blueprint_id.is_empty() {
                container.id.to_string()
            } else {
                container.blueprint_id.clone()
            };
            match allocate_ip(&mut in_use, &key) {
                Some(ip) => {
                    container.mac = mac_from_ip(&ip);
                    container.ip = ip;
                    view.commit(container);
                }
                None => warn!(container = %container, "virtual IP pool exhausted"),
            }
        }
    }

    // Refresh label membership from container IPs.
    let containers = view.rows::<Container>();
    for mut label in view.rows::<Label>() {
        let mut ips: Vec<String> = containers
            .iter()
            .filter(|c| c.labels.contains(&label.name) && !c.ip.is_empty())
            .map(|c| c.ip.clone())
            .collect();
        ips.sort();
        ips.dedup();
        if label.container_ips != ips {
            label.container_ips = ips;
            view.commit(label);
        }
    }
}

/// Labels double as DNS names; publish one hostname record per label
/// with an assigned IP.
fn sync_hostnames(view: &mut View, labels: &[Label]) {
    let desired: Vec<Hostname> = labels
        .iter()
        .filter(|l| !l.ip.is_empty())
        .map(|l| Hostname {
            id: 0,
            hostname: l.name.clone(),
            ip: l.ip.clone(),
        })
        .collect();

    let key = |h: &Hostname| (h.hostname.clone(), h.ip.clone());
    let diff = hash_join(view.rows::<Hostname>(), desired, key, key);

    for stale in diff.lefts {
        view.remove(&stale);
    }
    for mut fresh in diff.rights {
        let inserted = view.insert::<Hostname>();
        fresh.id = inserted.id;
        view.commit(fresh);
    }
}

/// Converge the overlay's address sets on one set per label.
async fn sync_address_sets(overlay: &dyn OverlayClient, labels: &[Label]) {
    let observed = match overlay.list_address_sets(SWITCH).await {
        Ok(observed) => observed,
        Err(err) => {
            warn!(error = %err, "failed to list address sets");
            return;
        }
    };

    let expected: Vec<AddressSet> = labels
        .iter()
        .map(|label| {
            let mut addresses: Vec<String> = label
                .container_ips
                .iter()
                .cloned()
                .chain(std::iter::once(label.ip.clone()))
                .filter(|ip| !ip.is_empty())
                .collect();
            addresses.sort();
            addresses.dedup();
            AddressSet {
                name: label.name.clone(),
                addresses,
            }
        })
        .collect();

    let key = |set: &AddressSet| (set.name.clone(), set.addresses.join(" "));
    let diff = hash_join(expected, observed, key, key);

    for stale in diff.rights {
        debug!(name = %stale.name, "deleting address set");
        if let Err(err) = overlay.delete_address_set(SWITCH, &stale.name).await {
            warn!(name = %stale.name, error = %err, "failed to delete address set");
        }
    }
    for fresh in diff.lefts {
        debug!(name = %fresh.name, "creating address set");
        if let Err(err) = overlay.create_address_set(SWITCH, fresh).await {
            warn!(error = %err, "failed to create address set");
        }
    }
}

/// Converge the overlay's rules on the connection policy: a symmetric
/// allow rule per connection over a priority-0 default drop.
async fn sync_rules(overlay: &dyn OverlayClient, connections: &[Connection]) {
    let observed = match overlay.list_rules(SWITCH).await {
        Ok(observed) => observed,
        Err(err) => {
            warn!(error = %err, "failed to list overlay rules");
            return;
        }
    };

    let mut expected = vec![OverlayRule {
        priority: 0,
        direction: "to-lport".into(),
        matcher: "ip".into(),
        action: "drop".into(),
    }];
    for connection in connections {
        // Connections to the public internet are enforced by the cloud
        // firewall, not the overlay.
        if connection.from == "public" || connection.to == "public" {
            continue;
        }
        expected.push(OverlayRule {
            priority: 1,
            direction: "to-lport".into(),
            matcher: match_string(connection),
            action: "allow".into(),
        });
    }

    let key = |rule: &OverlayRule| (rule.matcher.clone(), rule.action.clone());
    let diff = hash_join(expected, observed, key, key);

    for stale in diff.rights {
        if let Err(err) = overlay.delete_rule(SWITCH, &stale).await {
            warn!(error = %err, "failed to delete overlay rule");
        }
    }
    for fresh in diff.lefts {
        if let Err(err) = overlay.create_rule(SWITCH, fresh).await {
            warn!(error = %err, "failed to create overlay rule");
        }
    }
}

/// The match expression for one connection: traffic from `from` to `to`
/// on the destination port range, and the return path on the source port
/// range.
pub fn match_string(c: &Connection) -> String {
    or(&[
        and(&[
            and(&[from(&c.from), to(&c.to)]),
            port_constraint(c.min_port, c.max_port, "dst"),
        ]),
        and(&[
            and(&[from(&c.to), to(&c.from)]),
            port_constraint(c.min_port, c.max_port, "src"),
        ]),
    ])
}

fn port_constraint(min: u16, max: u16, direction: &str) -> String {
    format!(
        "(icmp || {min} <= udp.{direction} <= {max} || {min} <= tcp.{direction} <= {max})"
    )
}

fn from(target: &str) -> String {
    format!("ip4.src == ${target}")
}

fn to(target: &str) -> String {
    format!("ip4.dst == ${target}")
}

fn or(predicates: &[String]) -> String {
    format!("({})", predicates.join(" || "))
}

fn and(predicates: &[String]) -> String {
    format!("({})", predicates.join(" && "))
}

// ── Virtual IP allocation ──────────────────────────────────────────

const POOL_PREFIX: u32 = 0x0a00_0000; // 10.0.0.0/8
const POOL_MASK: u32 = 0x00ff_ffff;

/// Hash a name into the 10.0.0.0/8 pool, rehashing past collisions and
/// the network/broadcast-looking suffixes. Deterministic for a given key
/// and set of occupied addresses.
fn allocate_ip(in_use: &mut HashSet<u32>, key: &str) -> Option<String> {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let mut h = hasher.finish() as u32;

    for _ in 0..1024 {
        let suffix = h & POOL_MASK;
        let last_octet = suffix & 0xff;
        if last_octet != 0 && last_octet != 255 {
            let ip = POOL_PREFIX | suffix;
            if in_use.insert(ip) {
                return Some(format_ip(ip));
            }
        }
        let mut rehash = DefaultHasher::new();
        h.hash(&mut rehash);
        h = rehash.finish() as u32;
    }
    None
}

fn format_ip(ip: u32) -> String {
    std::net::Ipv4Addr::from(ip).to_string()
}

fn parse_ip(ip: &str) -> Option<u32> {
    ip.parse::<std::net::Ipv4Addr>().ok().map(u32::from)
}

/// A locally administered MAC derived from the virtual IP.
fn mac_from_ip(ip: &str) -> String {
    match parse_ip(ip) {
        Some(ip) => {
            let octets = ip.to_be_bytes();
            format!(
                "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
                octets[0], octets[1], octets[2], octets[3]
            )
        }
        None => String::new(),
    }
}

/// An in-memory overlay store for tests and development.
#[derive(Clone, Default)]
pub struct MemoryOverlay {
    inner: Arc<Mutex<MemoryOverlayState>>,
}

#[derive(Default)]
struct MemoryOverlayState {
    sets: Vec<AddressSet>,
    rules: Vec<OverlayRule>,
}

impl MemoryOverlay {
    pub fn new() -> MemoryOverlay {
        MemoryOverlay::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryOverlayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OverlayClient for MemoryOverlay {
    async fn list_address_sets(&self, _switch: &str) -> OverlayResult<Vec<AddressSet>> {
        Ok(self.lock().sets.clone())
    }

    async fn create_address_set(&self, _switch: &str, set: AddressSet) -> OverlayResult<()> {
        self.lock().sets.push(set);
        Ok(())
    }

    async fn delete_address_set(&self, _switch: &str, name: &str) -> OverlayResult<()> {
        self.lock().sets.retain(|s| s.name != name);
        Ok(())
    }

    async fn list_rules(&self, _switch: &str) -> OverlayResult<Vec<OverlayRule>> {
        Ok(self.lock().rules.clone())
    }

    async fn create_rule(&self, _switch: &str, rule: OverlayRule) -> OverlayResult<()> {
        self.lock().rules.push(rule);
        Ok(())
    }

    async fn delete_rule(&self, _switch: &str, rule: &OverlayRule) -> OverlayResult<()> {
        self.lock().rules.retain(|r| r != rule);
        Ok(())
    }
}

//! Table kinds and row types.
//!
//! Every entity in the system lives in exactly one typed table. Rows are
//! plain data: cloning them out of a transaction detaches them from the
//! database, and nothing changes until they are committed back.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Process-wide unique row identifier. Never reused.
pub type RowId = u32;

/// The set of tables in the database.
///
/// The discriminant order is the canonical lock order for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Cluster,
    Machine,
    Container,
    Minion,
    Connection,
    Label,
    Etcd,
    Placement,
    AclRule,
    Image,
    Hostname,
}

impl TableKind {
    /// All tables, in canonical order.
    pub const ALL: [TableKind; 11] = [
        TableKind::Cluster,
        TableKind::Machine,
        TableKind::Container,
        TableKind::Minion,
        TableKind::Connection,
        TableKind::Label,
        TableKind::Etcd,
        TableKind::Placement,
        TableKind::AclRule,
        TableKind::Image,
        TableKind::Hostname,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TableKind::Cluster => "cluster",
            TableKind::Machine => "machine",
            TableKind::Container => "container",
            TableKind::Minion => "minion",
            TableKind::Connection => "connection",
            TableKind::Label => "label",
            TableKind::Etcd => "etcd",
            TableKind::Placement => "placement",
            TableKind::AclRule => "acl",
            TableKind::Image => "image",
            TableKind::Hostname => "hostname",
        }
    }

    /// Parse a table name as used by the query API.
    pub fn parse(name: &str) -> Option<TableKind> {
        TableKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of table kinds, carried by transactions as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSet(u16);

impl TableSet {
    pub const EMPTY: TableSet = TableSet(0);

    /// Every table. Mostly for tests and the query API, where there is no
    /// reason to think hard about which tables a transaction needs.
    pub fn all() -> TableSet {
        TableSet::of(&TableKind::ALL)
    }

    pub fn of(kinds: &[TableKind]) -> TableSet {
        let mut mask = 0;
        for k in kinds {
            mask |= k.bit();
        }
        TableSet(mask)
    }

    pub fn with(self, kind: TableKind) -> TableSet {
        TableSet(self.0 | kind.bit())
    }

    pub fn contains(self, kind: TableKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Iterate the contained kinds in canonical order.
    pub fn iter(self) -> impl Iterator<Item = TableKind> {
        TableKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

/// Cloud providers a machine can live on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Provider {
    Amazon,
    DigitalOcean,
    Google,
    Vagrant,
    /// In-memory provider used by tests and single-node development.
    #[default]
    Mock,
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Amazon" => Ok(Provider::Amazon),
            "DigitalOcean" => Ok(Provider::DigitalOcean),
            "Google" => Ok(Provider::Google),
            "Vagrant" => Ok(Provider::Vagrant),
            "Mock" => Ok(Provider::Mock),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::Amazon => "Amazon",
            Provider::DigitalOcean => "DigitalOcean",
            Provider::Google => "Google",
            Provider::Vagrant => "Vagrant",
            Provider::Mock => "Mock",
        };
        f.write_str(s)
    }
}

/// The role a machine or minion plays in the cluster.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Role {
    #[default]
    None,
    Master,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::None => "None",
            Role::Master => "Master",
            Role::Worker => "Worker",
        };
        f.write_str(s)
    }
}

/// A cloud machine the cluster wants (or has). Inserted by the engine,
/// fleshed out by the cloud reconciler, and health-tracked by the foreman.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Machine {
    pub id: RowId,
    pub cloud_id: String,
    pub provider: Provider,
    pub region: String,
    pub size: String,
    pub disk_size: u32,
    pub role: Role,
    pub public_ip: String,
    pub private_ip: String,
    pub floating_ip: String,
    pub preemptible: bool,
    pub authorized_keys: String,
    pub connected: bool,
    pub subnet: String,
    pub blueprint: String,
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Machine-{}{{{} {} {} {}", self.id, self.role, self.provider, self.region, self.size)?;
        if !self.cloud_id.is_empty() {
            write!(f, ", CloudID={}", self.cloud_id)?;
        }
        if !self.public_ip.is_empty() {
            write!(f, ", PublicIP={}", self.public_ip)?;
        }
        if !self.floating_ip.is_empty() {
            write!(f, ", FloatingIP={}", self.floating_ip)?;
        }
        f.write_str("}")
    }
}

/// A desired application container and, once placed and started, the
/// runtime identity it acquired.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Container {
    pub id: RowId,
    /// Stable content fingerprint assigned by the blueprint compiler.
    pub blueprint_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: Vec<String>,
    pub ip: String,
    pub mac: String,
    pub runtime_id: String,
    pub pid: u32,
    /// Private IP of the worker this container is assigned to.
    pub minion: String,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Container-{}{{{}", self.id, self.image)?;
        if !self.command.is_empty() {
            write!(f, " {}", self.command.join(" "))?;
        }
        if !self.minion.is_empty() {
            write!(f, ", Minion={}", self.minion)?;
        }
        if !self.runtime_id.is_empty() {
            write!(f, ", RuntimeID={}", self.runtime_id)?;
        }
        f.write_str("}")
    }
}

/// A named group of containers with a virtual IP; doubles as a DNS name
/// and an ACL identifier.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Label {
    pub id: RowId,
    pub name: String,
    pub ip: String,
    pub container_ips: Vec<String>,
    pub annotations: Vec<String>,
}

/// An allow-rule between two labels (or a label and `public`) over a port
/// range. When either end is `public`, min_port == max_port.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Connection {
    pub id: RowId,
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// An affinity constraint on where a label's containers may run. At most
/// one of the optional constraint fields is non-empty.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Placement {
    pub id: RowId,
    pub target_label: String,
    pub exclusive: bool,
    pub other_label: String,
    pub provider: String,
    pub region: String,
    pub size: String,
    pub floating_ip: String,
}

/// The agent record for a cluster machine. Exactly one row has
/// `self_node == true` on each node at steady state.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Minion {
    pub id: RowId,
    pub private_ip: String,
    pub public_ip: String,
    pub role: Role,
    pub blueprint: String,
    pub provider: String,
    pub region: String,
    pub size: String,
    pub self_node: bool,
    pub authorized_keys: String,
}

/// Singleton: the coordination-store membership this node knows about,
/// and whether this node currently holds the leader lease.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Etcd {
    pub id: RowId,
    pub etcd_ips: Vec<String>,
    pub leader: bool,
    pub leader_ip: String,
}

/// Singleton: the deployment this daemon is responsible for.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Cluster {
    pub id: RowId,
    pub namespace: String,
    pub blueprint: String,
    pub regions: BTreeMap<Provider, Vec<String>>,
}

/// A DNS name for a virtual IP.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hostname {
    pub id: RowId,
    pub hostname: String,
    pub ip: String,
}

/// A custom image to be built by the leader's registry.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Image {
    pub id: RowId,
    pub name: String,
    pub dockerfile: String,
    /// Identity of the built image; empty until the build completes.
    pub runtime_id: String,
}

/// An administrator CIDR allowed to reach the cluster machines.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AclRule {
    pub id: RowId,
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_set_membership() {
        let set = TableSet::of(&[TableKind::Machine, TableKind::Etcd]);
        assert!(set.contains(TableKind::Machine));
        assert!(set.contains(TableKind::Etcd));
        assert!(!set.contains(TableKind::Container));
    }

    #[test]
    fn table_set_iterates_in_canonical_order() {
        let set = TableSet::of(&[TableKind::Etcd, TableKind::Cluster, TableKind::Machine]);
        let kinds: Vec<TableKind> = set.iter().collect();
        assert_eq!(
            kinds,
            vec![TableKind::Cluster, TableKind::Machine, TableKind::Etcd]
        );
    }

    #[test]
    fn table_kind_parse_round_trips() {
        for kind in TableKind::ALL {
            assert_eq!(TableKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(TableKind::parse("no-such-table"), None);
    }

    #[test]
    fn machine_display_is_terse() {
        let m = Machine {
            id: 3,
            provider: Provider::Amazon,
            region: "us-west-1".into(),
            size: "m4.large".into(),
            role: Role::Worker,
            cloud_id: "i-123".into(),
            ..Machine::default()
        };
        let s = m.to_string();
        assert!(s.starts_with("Machine-3{"));
        assert!(s.contains("CloudID=i-123"));
        assert!(!s.contains("FloatingIP"));
    }

    #[test]
    fn provider_parses_from_display() {
        for p in [
            Provider::Amazon,
            Provider::DigitalOcean,
            Provider::Google,
            Provider::Vagrant,
            Provider::Mock,
        ] {
            assert_eq!(p.to_string().parse::<Provider>(), Ok(p));
        }
        assert!("Azure".parse::<Provider>().is_err());
    }
}

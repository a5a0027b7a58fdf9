//! Cloud-side descriptions of machines and firewall rules.

use flotilla_db::{Provider, Role};

/// A machine as a cloud provider reports it, or as we ask one to boot it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CloudMachine {
    /// Provider-assigned instance ID; empty on boot requests.
    pub id: String,
    pub provider: Provider,
    pub region: String,
    pub size: String,
    pub disk_size: u32,
    pub role: Role,
    pub preemptible: bool,
    pub public_ip: String,
    pub private_ip: String,
    pub floating_ip: String,
    pub ssh_keys: Vec<String>,
}

/// A firewall rule: a CIDR allowed to reach the cluster over a port range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Acl {
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl Acl {
    /// An ACL spanning every port.
    pub fn full_range(cidr_ip: impl Into<String>) -> Acl {
        Acl {
            cidr_ip: cidr_ip.into(),
            min_port: 1,
            max_port: 65535,
        }
    }
}

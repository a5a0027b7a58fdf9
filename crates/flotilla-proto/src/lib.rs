//! flotilla-proto — generated protobuf types and gRPC service stubs for
//! the daemon API and the minion configuration protocol, plus the version
//! string both sides exchange to detect schema skew.

tonic::include_proto!("flotilla");

/// The version the daemon and minions report to each other. The foreman
/// refuses to push configuration to a minion running a different version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

impl From<flotilla_db::Role> for Role {
    fn from(role: flotilla_db::Role) -> Role {
        match role {
            flotilla_db::Role::None => Role::None,
            flotilla_db::Role::Master => Role::Master,
            flotilla_db::Role::Worker => Role::Worker,
        }
    }
}

impl From<Role> for flotilla_db::Role {
    fn from(role: Role) -> flotilla_db::Role {
        match role {
            Role::None => flotilla_db::Role::None,
            Role::Master => flotilla_db::Role::Master,
            Role::Worker => flotilla_db::Role::Worker,
        }
    }
}

impl MinionConfig {
    /// The role field, tolerating values from an unknown future schema.
    pub fn db_role(&self) -> flotilla_db::Role {
        Role::try_from(self.role)
            .unwrap_or(Role::None)
            .into()
    }
}

//! flotilla-sync — distributed coordination over the KV store.
//!
//! Three protocols share the store:
//!
//! - **Election** ([`elector`]): masters race for the `/leader` TTL lease;
//!   the winner's `Etcd.leader` flag gates every leader-only loop.
//! - **Replication** ([`replicate`]): the leader publishes the Connection,
//!   Container, and Hostname tables; followers mirror them locally.
//! - **Membership** ([`membership`]): every minion leases a record under
//!   `/minion/nodes/` and mirrors its peers into the Minion table.

pub mod elector;
pub mod membership;
pub mod replicate;

pub use elector::{campaign_once, run_election, watch_leader_once, ELECTION_TTL};
pub use membership::{read_minions, run_membership, write_minion, MEMBER_TIMEOUT};
pub use replicate::{run_replication, sync_table_once, Replicated};

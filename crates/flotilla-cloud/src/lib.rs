//! flotilla-cloud — drives cloud providers toward the desired machine,
//! firewall, and floating-IP state recorded in the database.
//!
//! The [`CloudClient`] trait is the full capability set a provider must
//! offer; SDK bindings implement it out of tree and register through the
//! [`Factory`] seam. The [`Reconciler`] diffs provider `list` output
//! against the Machine table each cycle and issues the boot/stop/
//! floating-IP/ACL calls that close the gap.

mod machine;
mod mock;
mod provider;
mod reconciler;

pub use machine::{Acl, CloudMachine};
pub use mock::MockCloud;
pub use provider::{default_factory, CloudClient, CloudError, CloudResult, Factory};
pub use reconciler::{build_acls, run, sync_machines, update_reconciler, Reconciler, SyncPlan};

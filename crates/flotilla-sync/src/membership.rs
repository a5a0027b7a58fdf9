//! Minion membership through the store.
//!
//! Unlike the replicated tables, membership has no single writer: every
//! minion publishes its own record under `/minion/nodes/<private_ip>` on
//! a TTL lease and mirrors everyone else's records into its Minion table.
//! A minion that stops publishing ages out of the directory, and with it
//! out of every peer's table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use flotilla_db::{Conn, Minion, TableKind, TableSet};
use flotilla_join::hash_join;
use flotilla_store::Store;

/// Lease lifetime for a membership record; records refresh at half this.
pub const MEMBER_TIMEOUT: Duration = Duration::from_secs(30);
const NODES_DIR: &str = "/minion/nodes";

/// The membership loop: publish our record and mirror the directory,
/// every change to the Minion table and every half-lease.
pub async fn run_membership(conn: Conn, store: Arc<dyn Store>, mut shutdown: watch::Receiver<bool>) {
    let mut trigger = conn.trigger_tick(
        MEMBER_TIMEOUT.as_secs() / 2,
        TableSet::of(&[TableKind::Minion]),
    );

    loop {
        write_minion(&conn, store.as_ref()).await;
        read_minions(&conn, store.as_ref()).await;

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

/// Publish this node's record.
pub async fn write_minion(conn: &Conn, store: &dyn Store) {
    let minion = match conn.minion_self() {
        Ok(minion) => minion,
        Err(_) => return,
    };
    if minion.private_ip.is_empty() {
        return;
    }

    let payload = match serde_json::to_string(&minion) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize minion record");
            return;
        }
    };

    let key = format!("{NODES_DIR}/{}", minion.private_ip);
    if let Err(err) = store.set(&key, &payload, Some(MEMBER_TIMEOUT)).await {
        warn!(error = %err, "failed to publish minion record");
    }
}

/// Mirror every other node's record into the Minion table.
pub async fn read_minions(conn: &Conn, store: &dyn Store) {
    let tree = match store.get_tree(NODES_DIR).await {
        Ok(tree) => tree,
        Err(err) => {
            warn!(error = %err, "failed to read minion directory");
            return;
        }
    };

    let mut published: Vec<Minion> = Vec::new();
    for entry in tree {
        match serde_json::from_str(&entry.value) {
            Ok(minion) => published.push(minion),
            Err(err) => {
                warn!(path = %entry.path, error = %err, "ignoring unparseable minion record");
            }
        }
    }

    conn.txn(TableSet::of(&[TableKind::Minion]), |view| {
        let self_ip = view
            .minion_self()
            .map(|own| own.private_ip)
            .unwrap_or_default();

        let peers = view.select::<Minion>(|m| !m.self_node);
        let published: Vec<Minion> = published
            .into_iter()
            .filter(|m| m.private_ip != self_ip)
            .collect();

        let diff = hash_join(peers, published, membership_key, membership_key);
        let (removed, added) = (diff.lefts.len(), diff.rights.len());

        for row in diff.lefts {
            view.remove(&row);
        }
        for row in diff.rights {
            let fresh = view.insert::<Minion>();
            let mut row = row;
            row.id = fresh.id;
            row.self_node = false;
            view.commit(row);
        }

        if removed + added > 0 {
            debug!(removed, added, "minion membership changed");
        }
    });
}

/// Identity of a membership record: everything node-local is cleared.
fn membership_key(m: &Minion) -> Minion {
    let mut key = m.clone();
    key.id = 0;
    key.blueprint = String::new();
    key.self_node = false;
    key
}

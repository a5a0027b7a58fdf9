//! Table replication through the store.
//!
//! For each replicated table the leader is authoritative: it serializes
//! the local table to the table's store path whenever the contents drift
//! from what is stored. Followers mirror the stored value back into their
//! local table with a hash join on the ID-stripped row, so local row IDs
//! stay local while content converges.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use flotilla_db::{
    Callback, Cause, Conn, Connection, Container, Hostname, Row, TableKind, TableSet, View,
};
use flotilla_join::hash_join;
use flotilla_store::{Store, StoreError};

/// A table distributed through the store under a fixed path.
///
/// `stripped` clears whatever is node-local: row IDs always, plus runtime
/// identity for containers (workers discover that themselves).
pub trait Replicated:
    Row + Serialize + DeserializeOwned + Ord + std::hash::Hash + Eq + Sync
{
    const PATH: &'static str;

    fn stripped(&self) -> Self {
        let mut copy = self.clone();
        copy.set_id(0);
        copy
    }
}

impl Replicated for Connection {
    const PATH: &'static str = "/connections";
}

impl Replicated for Hostname {
    const PATH: &'static str = "/hostnames";
}

impl Replicated for Container {
    const PATH: &'static str = "/containers";

    fn stripped(&self) -> Self {
        let mut copy = self.clone();
        copy.set_id(0);
        copy.runtime_id = String::new();
        copy.pid = 0;
        copy
    }
}

/// Start the replication callbacks for every replicated table.
pub fn run_replication(conn: Conn, store: Arc<dyn Store>) {
    spawn_table_sync::<Connection>(conn.clone(), store.clone());
    spawn_table_sync::<Container>(conn.clone(), store.clone());
    spawn_table_sync::<Hostname>(conn, store);
}

fn spawn_table_sync<R: Replicated>(conn: Conn, store: Arc<dyn Store>) {
    let watch = store.watch(R::PATH, Duration::from_secs(1));
    conn.register_callback(
        format!("sync-{}", R::KIND),
        30,
        TableSet::of(&[R::KIND, TableKind::Etcd]),
        TableSync::<R> {
            conn: conn.clone(),
            store,
            _marker: PhantomData,
        },
    )
    .bind_trigger(watch);
}

struct TableSync<R> {
    conn: Conn,
    store: Arc<dyn Store>,
    _marker: PhantomData<fn() -> R>,
}

#[async_trait]
impl<R: Replicated> Callback for TableSync<R> {
    async fn on_cause(&mut self, _cause: Cause) {
        if let Err(err) = sync_table_once::<R>(&self.conn, self.store.as_ref()).await {
            warn!(path = R::PATH, error = %err, "table sync failed");
        }
    }
}

/// One replication round for one table.
pub async fn sync_table_once<R: Replicated>(
    conn: &Conn,
    store: &dyn Store,
) -> Result<(), StoreError> {
    let stored = store.get(R::PATH).await?.unwrap_or_default();

    if conn.etcd_leader() {
        let mut rows: Vec<R> = conn
            .select::<R>(|_| true)
            .iter()
            .map(|row| row.stripped())
            .collect();
        rows.sort();

        let payload = serde_json::to_string(&rows)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if payload != stored {
            store.set(R::PATH, &payload, None).await?;
            debug!(path = R::PATH, rows = rows.len(), "published table");
        }
    } else {
        let incoming: Vec<R> = if stored.is_empty() {
            Vec::new()
        } else {
            match serde_json::from_str(&stored) {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(path = R::PATH, error = %err, "ignoring unparseable table value");
                    return Ok(());
                }
            }
        };

        conn.txn(TableSet::of(&[R::KIND]), |view| mirror(view, incoming));
    }

    Ok(())
}

/// Reconcile the local table with the rows read from the store. Matches
/// are left alone, local-only rows are removed, store-only rows are
/// inserted under fresh local IDs.
fn mirror<R: Replicated>(view: &mut View, incoming: Vec<R>) {
    let local = view.rows::<R>();
    let diff = hash_join(local, incoming, |l: &R| l.stripped(), |r: &R| r.stripped());

    for row in diff.lefts {
        view.remove(&row);
    }

    for row in diff.rights {
        let fresh = view.insert::<R>();
        let mut row = row;
        row.set_id(fresh.id());
        view.commit(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_db::Etcd;
    use flotilla_store::MemoryStore;

    fn node(leader: bool) -> Conn {
        let conn = Conn::new();
        conn.txn(TableSet::of(&[TableKind::Etcd]), |view| {
            let mut etcd = view.insert::<Etcd>();
            etcd.leader = leader;
            view.commit(etcd);
        });
        conn
    }

    fn add_connection(conn: &Conn, from: &str, to: &str, port: u16) {
        conn.txn(TableSet::of(&[TableKind::Connection]), |view| {
            let mut c = view.insert::<Connection>();
            c.from = from.into();
            c.to = to.into();
            c.min_port = port;
            c.max_port = port;
            view.commit(c);
        });
    }

    #[tokio::test]
    async fn leader_publishes_and_follower_mirrors() {
        let store = MemoryStore::new();
        let leader = node(true);
        let follower = node(false);

        add_connection(&leader, "web", "db", 5432);
        add_connection(&leader, "public", "web", 80);

        sync_table_once::<Connection>(&leader, &store).await.unwrap();
        sync_table_once::<Connection>(&follower, &store).await.unwrap();

        let mirrored = follower.select::<Connection>(|_| true);
        assert_eq!(mirrored.len(), 2);
        assert!(mirrored.iter().any(|c| c.from == "public" && c.min_port == 80));
        // Follower rows carry local IDs, not the leader's.
        assert!(mirrored.iter().all(|c| c.id != 0));
    }

    #[tokio::test]
    async fn round_trip_matches_modulo_ids() {
        let store = MemoryStore::new();
        let leader = node(true);
        let follower = node(false);

        add_connection(&leader, "a", "b", 1);
        add_connection(&leader, "b", "c", 2);
        sync_table_once::<Connection>(&leader, &store).await.unwrap();
        sync_table_once::<Connection>(&follower, &store).await.unwrap();

        let strip_sort = |conn: &Conn| {
            let mut rows: Vec<Connection> = conn
                .select::<Connection>(|_| true)
                .iter()
                .map(|row| row.stripped())
                .collect();
            rows.sort();
            rows
        };
        assert_eq!(strip_sort(&leader), strip_sort(&follower));
    }

    #[tokio::test]
    async fn follower_drops_rows_absent_from_store() {
        let store = MemoryStore::new();
        let leader = node(true);
        let follower = node(false);

        add_connection(&follower, "stale", "row", 9);
        add_connection(&leader, "web", "db", 5432);

        sync_table_once::<Connection>(&leader, &store).await.unwrap();
        sync_table_once::<Connection>(&follower, &store).await.unwrap();

        let mirrored = follower.select::<Connection>(|_| true);
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].from, "web");
    }

    #[tokio::test]
    async fn leader_skips_write_when_unchanged() {
        let store = MemoryStore::new();
        let leader = node(true);
        add_connection(&leader, "web", "db", 5432);

        sync_table_once::<Connection>(&leader, &store).await.unwrap();
        let mut watch = store.watch("/connections", Duration::from_millis(1));

        sync_table_once::<Connection>(&leader, &store).await.unwrap();
        assert!(watch.try_recv().is_err());
    }

    #[tokio::test]
    async fn container_runtime_identity_survives_mirroring() {
        let store = MemoryStore::new();
        let leader = node(true);
        let follower = node(false);

        leader.txn(TableSet::of(&[TableKind::Container]), |view| {
            let mut c = view.insert::<Container>();
            c.blueprint_id = "abc123".into();
            c.image = "nginx".into();
            c.minion = "10.0.0.5".into();
            view.commit(c);
        });
        sync_table_once::<Container>(&leader, &store).await.unwrap();
        sync_table_once::<Container>(&follower, &store).await.unwrap();

        // The worker records the runtime identity it started.
        follower.txn(TableSet::of(&[TableKind::Container]), |view| {
            let mut c = view.rows::<Container>().remove(0);
            c.runtime_id = "runtime-1".into();
            c.pid = 42;
            view.commit(c);
        });

        // Another round must not clobber it: runtime identity is local.
        sync_table_once::<Container>(&follower, &store).await.unwrap();
        let rows = follower.select::<Container>(|_| true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].runtime_id, "runtime-1");
        assert_eq!(rows[0].pid, 42);
    }

    #[tokio::test]
    async fn empty_store_value_reads_as_empty_table() {
        let store = MemoryStore::new();
        let follower = node(false);
        add_connection(&follower, "stale", "row", 9);

        sync_table_once::<Connection>(&follower, &store).await.unwrap();
        assert!(follower.select::<Connection>(|_| true).is_empty());
    }
}

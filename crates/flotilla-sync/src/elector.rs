//! Leader election over the store's `/leader` key.
//!
//! Every master campaigns: holders refresh the TTL lease, challengers try
//! a linearizable create. Only the node holding the lease sees its own
//! `Etcd.leader` flag set; everyone mirrors the current holder's IP into
//! `Etcd.leader_ip`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use flotilla_db::{Callback, Cause, Conn, Etcd, Role, TableKind, TableSet};
use flotilla_store::{Store, StoreError};

/// Lifetime of the leader lease. A leader that stops refreshing loses the
/// key within this window.
pub const ELECTION_TTL: Duration = Duration::from_secs(30);
const ELECTION_TTL_SECS: u64 = ELECTION_TTL.as_secs();
const LEADER_KEY: &str = "/leader";

/// Register the election callbacks: campaign at half the lease lifetime
/// and on every change of the `/leader` key, and mirror the current
/// holder into the local Etcd row.
pub async fn run_election(conn: Conn, store: Arc<dyn Store>) {
    let watch = store.watch(LEADER_KEY, Duration::from_secs(1));
    conn.register_callback(
        "campaign",
        ELECTION_TTL_SECS / 2,
        TableSet::of(&[TableKind::Etcd]),
        Campaign {
            conn: conn.clone(),
            store: store.clone(),
        },
    )
    .bind_trigger(watch);

    // The leader view must be primed once; after this it only re-runs on
    // changes. Registered second so its initial run cannot block a
    // campaign.
    watch_leader_once(&conn, store.as_ref()).await;
    let watch = store.watch(LEADER_KEY, Duration::from_secs(1));
    conn.register_callback(
        "watch-leader",
        ELECTION_TTL_SECS.min(30),
        TableSet::of(&[TableKind::Etcd]),
        WatchLeader {
            conn: conn.clone(),
            store,
        },
    )
    .bind_trigger(watch);
}

struct Campaign {
    conn: Conn,
    store: Arc<dyn Store>,
}

#[async_trait]
impl Callback for Campaign {
    async fn on_cause(&mut self, _cause: Cause) {
        campaign_once(&self.conn, self.store.as_ref()).await;
    }
}

struct WatchLeader {
    conn: Conn,
    store: Arc<dyn Store>,
}

#[async_trait]
impl Callback for WatchLeader {
    async fn on_cause(&mut self, _cause: Cause) {
        watch_leader_once(&self.conn, self.store.as_ref()).await;
    }
}

/// One campaign round. Only a master on a converged etcd cluster with a
/// known private IP may hold the lease.
pub async fn campaign_once(conn: &Conn, store: &dyn Store) {
    let etcd_rows = conn.select::<Etcd>(|_| true);
    let minion = match conn.minion_self() {
        Ok(minion) => minion,
        Err(_) => return,
    };

    if minion.role != Role::Master || etcd_rows.len() != 1 {
        return;
    }

    let ip = minion.private_ip;
    if ip.is_empty() {
        return;
    }

    let result = if etcd_rows[0].leader {
        store.refresh(LEADER_KEY, &ip, Some(ELECTION_TTL)).await
    } else {
        store.create(LEADER_KEY, &ip, Some(ELECTION_TTL)).await
    };

    match result {
        Ok(()) => commit_leader(conn, true, Some(&ip)),
        // Somebody else holds the lease; their IP arrives via the watch.
        Err(StoreError::Exists(_)) => commit_leader(conn, false, None),
        Err(err) => {
            warn!(error = %err, "error setting leader key");
            commit_leader(conn, false, Some(""));
            // Give things a chance to settle down.
            tokio::time::sleep(ELECTION_TTL).await;
        }
    }
}

/// Mirror the `/leader` key into the local Etcd row.
pub async fn watch_leader_once(conn: &Conn, store: &dyn Store) {
    let leader = match store.get(LEADER_KEY).await {
        Ok(value) => value.unwrap_or_default(),
        Err(err) => {
            warn!(error = %err, "failed to read leader key");
            return;
        }
    };

    conn.txn(TableSet::of(&[TableKind::Etcd]), |view| {
        let mut rows = view.rows::<Etcd>();
        if rows.len() == 1 {
            let mut row = rows.remove(0);
            row.leader_ip = leader.clone();
            view.commit(row);
        }
    });
}

fn commit_leader(conn: &Conn, leader: bool, ip: Option<&str>) {
    conn.txn(TableSet::of(&[TableKind::Etcd]), |view| {
        let mut rows = view.rows::<Etcd>();
        if rows.len() == 1 {
            let mut row = rows.remove(0);
            row.leader = leader;
            if let Some(ip) = ip {
                row.leader_ip = ip.to_string();
            }
            view.commit(row);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_db::Minion;
    use flotilla_store::MemoryStore;

    fn master_node(ip: &str) -> Conn {
        let conn = Conn::new();
        conn.txn(TableSet::of(&[TableKind::Minion, TableKind::Etcd]), |view| {
            let mut own = view.insert::<Minion>();
            own.role = Role::Master;
            own.private_ip = ip.into();
            own.self_node = true;
            view.commit(own);

            let mut etcd = view.insert::<Etcd>();
            etcd.etcd_ips = vec![ip.into()];
            view.commit(etcd);
        });
        conn
    }

    fn leader_state(conn: &Conn) -> Etcd {
        conn.select::<Etcd>(|_| true).remove(0)
    }

    #[tokio::test]
    async fn lone_master_wins() {
        let store = MemoryStore::new();
        let conn = master_node("10.0.0.1");

        campaign_once(&conn, &store).await;

        let etcd = leader_state(&conn);
        assert!(etcd.leader);
        assert_eq!(etcd.leader_ip, "10.0.0.1");
        assert_eq!(
            store.get("/leader").await.unwrap(),
            Some("10.0.0.1".to_string())
        );
    }

    #[tokio::test]
    async fn challenger_defers_to_holder() {
        let store = MemoryStore::new();
        let holder = master_node("10.0.0.1");
        let challenger = master_node("10.0.0.2");

        campaign_once(&holder, &store).await;
        campaign_once(&challenger, &store).await;

        assert!(leader_state(&holder).leader);
        assert!(!leader_state(&challenger).leader);

        // The challenger learns the holder through the watch path.
        watch_leader_once(&challenger, &store).await;
        assert_eq!(leader_state(&challenger).leader_ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn holder_refreshes_lease() {
        let store = MemoryStore::new();
        let conn = master_node("10.0.0.1");

        campaign_once(&conn, &store).await;
        campaign_once(&conn, &store).await;

        assert!(leader_state(&conn).leader);
        assert_eq!(
            store.get("/leader").await.unwrap(),
            Some("10.0.0.1".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failover_after_lease_expiry() {
        let store = MemoryStore::new();
        let old = master_node("10.0.0.1");
        let new = master_node("10.0.0.2");

        campaign_once(&old, &store).await;
        campaign_once(&new, &store).await;
        assert!(!leader_state(&new).leader);

        // The old leader dies and stops refreshing; its lease runs out.
        tokio::time::advance(ELECTION_TTL + Duration::from_secs(1)).await;

        campaign_once(&new, &store).await;
        assert!(leader_state(&new).leader);
        assert_eq!(leader_state(&new).leader_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn workers_do_not_campaign() {
        let store = MemoryStore::new();
        let conn = Conn::new();
        conn.txn(TableSet::of(&[TableKind::Minion, TableKind::Etcd]), |view| {
            let mut own = view.insert::<Minion>();
            own.role = Role::Worker;
            own.private_ip = "10.0.0.1".into();
            own.self_node = true;
            view.commit(own);

            view.insert::<Etcd>();
        });

        campaign_once(&conn, &store).await;
        assert!(!leader_state(&conn).leader);
        assert_eq!(store.get("/leader").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unconverged_etcd_blocks_campaign() {
        let store = MemoryStore::new();
        let conn = master_node("10.0.0.1");
        conn.txn(TableSet::of(&[TableKind::Etcd]), |view| {
            view.insert::<Etcd>();
        });

        campaign_once(&conn, &store).await;
        assert_eq!(store.get("/leader").await.unwrap(), None);
    }

    struct DownStore;

    #[async_trait]
    impl Store for DownStore {
        async fn get(&self, path: &str) -> flotilla_store::StoreResult<Option<String>> {
            Err(StoreError::Unavailable(path.to_string()))
        }
        async fn set(
            &self,
            path: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> flotilla_store::StoreResult<()> {
            Err(StoreError::Unavailable(path.to_string()))
        }
        async fn create(
            &self,
            path: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> flotilla_store::StoreResult<()> {
            Err(StoreError::Unavailable(path.to_string()))
        }
        async fn refresh(
            &self,
            path: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> flotilla_store::StoreResult<()> {
            Err(StoreError::Unavailable(path.to_string()))
        }
        async fn mkdir(
            &self,
            path: &str,
            _ttl: Option<Duration>,
        ) -> flotilla_store::StoreResult<()> {
            Err(StoreError::Unavailable(path.to_string()))
        }
        async fn refresh_dir(
            &self,
            path: &str,
            _ttl: Option<Duration>,
        ) -> flotilla_store::StoreResult<()> {
            Err(StoreError::Unavailable(path.to_string()))
        }
        async fn get_tree(&self, path: &str) -> flotilla_store::StoreResult<Vec<flotilla_store::Entry>> {
            Err(StoreError::Unavailable(path.to_string()))
        }
        fn watch(&self, _path: &str, _debounce: Duration) -> tokio::sync::mpsc::Receiver<()> {
            tokio::sync::mpsc::channel(1).1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_relinquishes_and_backs_off() {
        let conn = master_node("10.0.0.1");
        // Pretend we were leader so the failure path has something to
        // relinquish.
        conn.txn(TableSet::of(&[TableKind::Etcd]), |view| {
            let mut row = view.rows::<Etcd>().remove(0);
            row.leader = true;
            row.leader_ip = "10.0.0.1".into();
            view.commit(row);
        });

        campaign_once(&conn, &DownStore).await;

        let etcd = leader_state(&conn);
        assert!(!etcd.leader);
        assert_eq!(etcd.leader_ip, "");
    }
}

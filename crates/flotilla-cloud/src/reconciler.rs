//! The cloud reconciliation loop.
//!
//! One reconciler owns all cloud state for a namespace. Each cycle it
//! fetches the machines every (provider, region) pair reports, diffs them
//! against the Machine table, and drives the providers toward the desired
//! state: boot what is missing, stop what is surplus, reassign floating
//! IPs that drifted, and push the recomputed firewall rules.
//!
//! Failures are cycle-scoped: a provider call that errors is logged and
//! retried on the next tick, and because `list` is re-fetched every cycle
//! there is no state to repair in between.

use std::collections::{BTreeMap, HashMap};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_db::{AclRule, Cluster, Conn, Connection, Machine, Provider, TableKind, TableSet};
use flotilla_join::score_join;

use crate::machine::{Acl, CloudMachine};
use crate::provider::{CloudClient, Factory};

/// What one diff of cloud state against the Machine table asks for.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Machines to boot, grouped later by (provider, region).
    pub boot: Vec<CloudMachine>,
    /// Cloud machines with no desired counterpart.
    pub stop: Vec<CloudMachine>,
    /// Matched machines whose floating IP must change; each carries the
    /// desired floating IP.
    pub update_ips: Vec<CloudMachine>,
    /// DB rows refreshed with the identity of their matched cloud machine.
    pub commits: Vec<Machine>,
    /// Number of matched pairs.
    pub pairs: usize,
}

/// Diff the cloud's machines against the desired rows.
///
/// A desired row can only match a cloud machine with identical shape
/// (provider, region, size, disk, role, preemptibility). Among machines of
/// the same shape, a row holding the machine's cloud ID matches it first,
/// then rows with no cloud ID yet, then rows recorded against a machine
/// that has since disappeared.
pub fn sync_machines(cloud: Vec<CloudMachine>, desired: Vec<Machine>) -> SyncPlan {
    let res = score_join(desired, cloud, |db, cm| {
        if db.provider != cm.provider
            || db.region != cm.region
            || db.size != cm.size
            || db.disk_size != cm.disk_size
            || db.role != cm.role
            || db.preemptible != cm.preemptible
        {
            None
        } else if db.cloud_id == cm.id {
            Some(0)
        } else if db.cloud_id.is_empty() {
            Some(1)
        } else {
            Some(2)
        }
    });

    let mut plan = SyncPlan {
        boot: res.lefts.iter().map(boot_template).collect(),
        stop: res.rights,
        pairs: res.pairs.len(),
        ..SyncPlan::default()
    };

    for (mut db, cm) in res.pairs {
        if db.floating_ip != cm.floating_ip {
            let mut target = cm.clone();
            target.floating_ip = db.floating_ip.clone();
            plan.update_ips.push(target);
        }

        db.cloud_id = cm.id;
        db.public_ip = cm.public_ip;
        db.private_ip = cm.private_ip;
        plan.commits.push(db);
    }

    plan
}

/// The boot request for a desired row. Floating IPs are never part of a
/// boot; they are assigned once the machine exists.
fn boot_template(db: &Machine) -> CloudMachine {
    CloudMachine {
        provider: db.provider,
        region: db.region.clone(),
        size: db.size.clone(),
        disk_size: db.disk_size,
        role: db.role,
        preemptible: db.preemptible,
        ssh_keys: db
            .authorized_keys
            .lines()
            .map(str::to_string)
            .collect(),
        ..CloudMachine::default()
    }
}

/// Compute the full firewall rule set: administrator CIDRs, this host,
/// every machine's public IP at full range, and the publicly exposed port
/// ranges open to the world.
pub fn build_acls(
    admin: &[AclRule],
    connections: &[Connection],
    machines: &[Machine],
    local_ip: Option<&str>,
) -> Vec<Acl> {
    let mut acls: Vec<Acl> = admin
        .iter()
        .map(|rule| Acl {
            cidr_ip: rule.cidr_ip.clone(),
            min_port: rule.min_port,
            max_port: rule.max_port,
        })
        .collect();

    if let Some(ip) = local_ip {
        acls.push(Acl::full_range(format!("{ip}/32")));
    }

    for (min, max) in public_port_ranges(connections) {
        acls.push(Acl {
            cidr_ip: "0.0.0.0/0".into(),
            min_port: min,
            max_port: max,
        });
    }

    for m in machines {
        if !m.public_ip.is_empty() {
            acls.push(Acl::full_range(format!("{}/32", m.public_ip)));
        }
    }

    acls
}

/// Port ranges of connections that involve `public`, deduplicated.
fn public_port_ranges(connections: &[Connection]) -> Vec<(u16, u16)> {
    let mut ranges: Vec<(u16, u16)> = connections
        .iter()
        .filter(|c| c.from == "public" || c.to == "public")
        .map(|c| (c.min_port, c.max_port))
        .collect();
    ranges.sort_unstable();
    ranges.dedup();
    ranges
}

/// Owns the provider clients for one namespace.
pub struct Reconciler {
    conn: Conn,
    namespace: String,
    regions: BTreeMap<Provider, Vec<String>>,
    advertise_ip: Option<String>,
    providers: HashMap<(Provider, String), std::sync::Arc<dyn CloudClient>>,
}

impl Reconciler {
    /// Build a reconciler with a client per (provider, region) pair.
    /// Providers with no available client are logged and skipped; their
    /// machines stay unmet desired rows.
    pub fn new(
        conn: Conn,
        namespace: &str,
        regions: &BTreeMap<Provider, Vec<String>>,
        advertise_ip: Option<String>,
        factory: &Factory,
    ) -> Reconciler {
        let mut providers = HashMap::new();
        for (&provider, region_list) in regions {
            for region in region_list {
                match factory(provider, namespace, region) {
                    Ok(client) => {
                        providers.insert((provider, region.clone()), client);
                    }
                    Err(err) => {
                        warn!(%provider, %region, error = %err, "skipping provider");
                    }
                }
            }
        }

        info!(%namespace, providers = providers.len(), "cloud reconciler ready");
        Reconciler {
            conn,
            namespace: namespace.to_string(),
            regions: regions.clone(),
            advertise_ip,
            providers,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// One reconciliation cycle.
    pub async fn run_once(&self) {
        // Two passes: the first boots and stops machines, the second
        // assigns floating IPs to machines that appeared in the first.
        for _ in 0..2 {
            if !self.sync_once().await {
                return;
            }
        }
        self.sync_acls().await;
    }

    /// Fetch, diff, and dispatch. Returns false when the cycle had to be
    /// abandoned because cloud state could not be read.
    async fn sync_once(&self) -> bool {
        let cloud = match self.list_all().await {
            Some(cloud) => cloud,
            None => return false,
        };

        let plan = self
            .conn
            .txn(TableSet::of(&[TableKind::Machine]), |view| {
                let plan = sync_machines(cloud, view.rows::<Machine>());
                for row in &plan.commits {
                    view.commit(row.clone());
                }
                plan
            });

        debug!(
            boot = plan.boot.len(),
            stop = plan.stop.len(),
            update_ips = plan.update_ips.len(),
            pairs = plan.pairs,
            "cloud sync planned"
        );

        self.dispatch(plan).await;
        true
    }

    /// Aggregate `list` across every provider in parallel. Any failure
    /// abandons the cycle: acting on a partial view would double-boot the
    /// machines of the region that failed to answer.
    async fn list_all(&self) -> Option<Vec<CloudMachine>> {
        let lists = join_all(self.providers.iter().map(|(key, client)| {
            let client = client.clone();
            let key = key.clone();
            async move { (key, client.list().await) }
        }))
        .await;

        let mut machines = Vec::new();
        for ((provider, region), result) in lists {
            match result {
                Ok(listed) => machines.extend(listed),
                Err(err) => {
                    warn!(%provider, %region, error = %err, "failed to list machines");
                    return None;
                }
            }
        }
        Some(machines)
    }

    async fn dispatch(&self, plan: SyncPlan) {
        join_all(group(plan.boot).into_iter().filter_map(|(key, batch)| {
            let client = self.providers.get(&key)?.clone();
            Some(async move {
                info!(provider = %key.0, region = %key.1, count = batch.len(), "booting machines");
                if let Err(err) = client.boot(batch).await {
                    warn!(provider = %key.0, error = %err, "boot failed");
                }
            })
        }))
        .await;

        join_all(group(plan.stop).into_iter().filter_map(|(key, batch)| {
            let client = self.providers.get(&key)?.clone();
            Some(async move {
                info!(provider = %key.0, region = %key.1, count = batch.len(), "stopping machines");
                if let Err(err) = client.stop(batch).await {
                    warn!(provider = %key.0, error = %err, "stop failed");
                }
            })
        }))
        .await;

        join_all(
            group(plan.update_ips)
                .into_iter()
                .filter_map(|(key, batch)| {
                    let client = self.providers.get(&key)?.clone();
                    Some(async move {
                        info!(provider = %key.0, region = %key.1, count = batch.len(), "updating floating IPs");
                        if let Err(err) = client.update_floating_ips(batch).await {
                            warn!(provider = %key.0, error = %err, "floating IP update failed");
                        }
                    })
                }),
        )
        .await;
    }

    /// Push the recomputed firewall rules to every provider.
    async fn sync_acls(&self) {
        let (admin, connections, machines) = self.conn.txn(
            TableSet::of(&[TableKind::AclRule, TableKind::Connection, TableKind::Machine]),
            |view| {
                (
                    view.rows::<AclRule>(),
                    view.rows::<Connection>(),
                    view.rows::<Machine>(),
                )
            },
        );

        let acls = build_acls(
            &admin,
            &connections,
            &machines,
            self.advertise_ip.as_deref(),
        );

        join_all(self.providers.iter().map(|(key, client)| {
            let client = client.clone();
            let key = key.clone();
            let acls = acls.clone();
            async move {
                if let Err(err) = client.set_acls(acls).await {
                    warn!(provider = %key.0, region = %key.1, error = %err, "ACL sync failed");
                }
            }
        }))
        .await;
    }
}

fn group(machines: Vec<CloudMachine>) -> HashMap<(Provider, String), Vec<CloudMachine>> {
    let mut grouped: HashMap<(Provider, String), Vec<CloudMachine>> = HashMap::new();
    for m in machines {
        grouped
            .entry((m.provider, m.region.clone()))
            .or_default()
            .push(m);
    }
    grouped
}

/// Keep the current reconciler while the cluster row still describes it;
/// construct a fresh one when the namespace or region set changed. Old
/// provider handles are simply dropped: cloud resources are addressed only
/// by namespace tag, so there is nothing to tear down.
pub fn update_reconciler(
    conn: &Conn,
    advertise_ip: Option<String>,
    factory: &Factory,
    current: Option<Reconciler>,
) -> Option<Reconciler> {
    let cluster: Option<Cluster> = conn
        .txn(TableSet::of(&[TableKind::Cluster]), |view| {
            view.cluster().ok()
        });
    let cluster = cluster?;

    if let Some(existing) = current {
        if existing.namespace == cluster.namespace && existing.regions == cluster.regions {
            return Some(existing);
        }
        info!(
            old = %existing.namespace,
            new = %cluster.namespace,
            "cluster changed, rebuilding cloud reconciler"
        );
    }

    Some(Reconciler::new(
        conn.clone(),
        &cluster.namespace,
        &cluster.regions,
        advertise_ip,
        factory,
    ))
}

/// The reconciliation loop: rebuild on cluster change, reconcile on every
/// machine/ACL/connection change and on a 30 second tick.
pub async fn run(
    conn: Conn,
    advertise_ip: Option<String>,
    factory: Factory,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut trigger = conn.trigger_tick(
        30,
        TableSet::of(&[
            TableKind::Machine,
            TableKind::Cluster,
            TableKind::AclRule,
            TableKind::Connection,
        ]),
    );

    let mut current: Option<Reconciler> = None;
    loop {
        current = update_reconciler(&conn, advertise_ip.clone(), &factory, current);
        if let Some(rec) = current.as_ref() {
            rec.run_once().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCloud;
    use flotilla_db::Role;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const REGION: &str = "test-region";

    fn db_machine(size: &str) -> Machine {
        Machine {
            provider: Provider::Mock,
            region: REGION.into(),
            size: size.into(),
            role: Role::Master,
            ..Machine::default()
        }
    }

    fn cloud_machine(size: &str) -> CloudMachine {
        CloudMachine {
            provider: Provider::Mock,
            region: REGION.into(),
            size: size.into(),
            role: Role::Master,
            ..CloudMachine::default()
        }
    }

    #[test]
    fn sync_boots_missing_machines() {
        let plan = sync_machines(vec![], vec![db_machine("m4.large"), db_machine("m4.large")]);
        assert_eq!(plan.boot.len(), 2);
        assert!(plan.stop.is_empty());
        assert!(plan.update_ips.is_empty());
        assert_eq!(plan.boot[0].size, "m4.large");
    }

    #[test]
    fn sync_partial_boot() {
        let plan = sync_machines(
            vec![cloud_machine("m4.large")],
            vec![db_machine("m4.large"), db_machine("m4.xlarge")],
        );
        assert_eq!(plan.boot.len(), 1);
        assert_eq!(plan.boot[0].size, "m4.xlarge");
        assert!(plan.stop.is_empty());
        assert_eq!(plan.pairs, 1);
    }

    #[test]
    fn sync_stops_surplus_machines() {
        let plan = sync_machines(
            vec![cloud_machine("m4.large"), cloud_machine("m4.xlarge")],
            vec![],
        );
        assert!(plan.boot.is_empty());
        assert_eq!(plan.stop.len(), 2);
    }

    #[test]
    fn sync_disk_size_mismatch_replaces() {
        let mut cm = cloud_machine("m4.large");
        cm.disk_size = 3;
        let mut db = db_machine("m4.large");
        db.disk_size = 4;

        let plan = sync_machines(vec![cm], vec![db]);
        assert_eq!(plan.boot.len(), 1);
        assert_eq!(plan.stop.len(), 1);
    }

    #[test]
    fn sync_assigns_floating_ip() {
        let mut cm = cloud_machine("m4.large");
        cm.id = "i-1".into();
        let mut db = db_machine("m4.large");
        db.floating_ip = "198.51.100.7".into();

        let plan = sync_machines(vec![cm], vec![db]);
        assert_eq!(plan.update_ips.len(), 1);
        assert_eq!(plan.update_ips[0].id, "i-1");
        assert_eq!(plan.update_ips[0].floating_ip, "198.51.100.7");
    }

    #[test]
    fn sync_removes_floating_ip() {
        let mut cm = cloud_machine("m4.large");
        cm.id = "i-1".into();
        cm.floating_ip = "198.51.100.7".into();

        let plan = sync_machines(vec![cm], vec![db_machine("m4.large")]);
        assert_eq!(plan.update_ips.len(), 1);
        assert_eq!(plan.update_ips[0].floating_ip, "");
    }

    #[test]
    fn sync_prefers_existing_cloud_id() {
        let mut cm1 = cloud_machine("m4.large");
        cm1.id = "i-1".into();
        let mut cm2 = cloud_machine("m4.large");
        cm2.id = "i-2".into();

        let mut db = db_machine("m4.large");
        db.cloud_id = "i-2".into();

        let plan = sync_machines(vec![cm1, cm2], vec![db]);
        assert_eq!(plan.commits[0].cloud_id, "i-2");
        assert_eq!(plan.stop.len(), 1);
        assert_eq!(plan.stop[0].id, "i-1");
    }

    #[test]
    fn sync_fills_identity_from_cloud() {
        let mut cm = cloud_machine("m4.large");
        cm.id = "i-9".into();
        cm.public_ip = "203.0.113.9".into();
        cm.private_ip = "10.0.0.9".into();

        let plan = sync_machines(vec![cm], vec![db_machine("m4.large")]);
        assert_eq!(plan.commits.len(), 1);
        assert_eq!(plan.commits[0].cloud_id, "i-9");
        assert_eq!(plan.commits[0].public_ip, "203.0.113.9");
        assert_eq!(plan.commits[0].private_ip, "10.0.0.9");
    }

    #[test]
    fn acls_cover_admins_host_ports_and_machines() {
        let admin = vec![AclRule {
            cidr_ip: "192.0.2.0/24".into(),
            min_port: 1,
            max_port: 65535,
            ..AclRule::default()
        }];
        let connections = vec![
            Connection {
                from: "public".into(),
                to: "web".into(),
                min_port: 80,
                max_port: 80,
                ..Connection::default()
            },
            Connection {
                from: "web".into(),
                to: "db".into(),
                min_port: 5432,
                max_port: 5432,
                ..Connection::default()
            },
        ];
        let machines = vec![
            Machine {
                public_ip: "8.8.8.8".into(),
                ..Machine::default()
            },
            Machine::default(),
        ];

        let acls = build_acls(&admin, &connections, &machines, Some("5.6.7.8"));
        assert_eq!(
            acls,
            vec![
                Acl {
                    cidr_ip: "192.0.2.0/24".into(),
                    min_port: 1,
                    max_port: 65535,
                },
                Acl::full_range("5.6.7.8/32"),
                Acl {
                    cidr_ip: "0.0.0.0/0".into(),
                    min_port: 80,
                    max_port: 80,
                },
                Acl::full_range("8.8.8.8/32"),
            ]
        );
    }

    // ── Cycle tests against the mock cloud ─────────────────────────

    type Registry = Arc<Mutex<std::collections::HashMap<(Provider, String), MockCloud>>>;

    fn registry_factory() -> (Factory, Registry, Arc<AtomicU32>) {
        let registry: Registry = Registry::default();
        let created = Arc::new(AtomicU32::new(0));

        let reg = registry.clone();
        let count = created.clone();
        let factory: Factory = Arc::new(
            move |provider: Provider,
                  namespace: &str,
                  region: &str|
                  -> crate::CloudResult<Arc<dyn crate::CloudClient>> {
                count.fetch_add(1, Ordering::SeqCst);
                let mut reg = reg.lock().unwrap();
                let cloud = reg
                    .entry((provider, region.to_string()))
                    .or_insert_with(|| MockCloud::new(namespace, region))
                    .clone();
                Ok(Arc::new(cloud))
            },
        );

        (factory, registry, created)
    }

    fn insert_machine(conn: &Conn, size: &str, floating_ip: &str) -> Machine {
        conn.txn(TableSet::of(&[TableKind::Machine]), |view| {
            let mut m = view.insert::<Machine>();
            m.provider = Provider::Mock;
            m.region = REGION.into();
            m.size = size.into();
            m.role = Role::Master;
            m.floating_ip = floating_ip.into();
            view.commit(m.clone());
            m
        })
    }

    fn test_reconciler(conn: &Conn) -> (Reconciler, Registry) {
        let (factory, registry, _) = registry_factory();
        let mut regions = BTreeMap::new();
        regions.insert(Provider::Mock, vec![REGION.to_string()]);
        let rec = Reconciler::new(conn.clone(), "ns", &regions, Some("5.6.7.8".into()), &factory);
        (rec, registry)
    }

    fn mock(registry: &Registry) -> MockCloud {
        registry
            .lock()
            .unwrap()
            .get(&(Provider::Mock, REGION.to_string()))
            .expect("mock provider built")
            .clone()
    }

    #[tokio::test]
    async fn cycle_boots_then_converges() {
        let conn = Conn::new();
        let (rec, registry) = test_reconciler(&conn);
        insert_machine(&conn, "m4.large", "");

        rec.run_once().await;
        let cloud = mock(&registry);
        assert_eq!(cloud.boots().len(), 1);
        assert_eq!(cloud.boots()[0].size, "m4.large");

        // The DB row picked up its cloud identity.
        let rows = conn.select::<Machine>(|_| true);
        assert!(!rows[0].cloud_id.is_empty());
        assert!(!rows[0].public_ip.is_empty());

        // A second cycle has nothing to do.
        cloud.clear_log();
        rec.run_once().await;
        assert!(cloud.boots().is_empty());
        assert!(cloud.stops().is_empty());
    }

    #[tokio::test]
    async fn cycle_stops_removed_machines() {
        let conn = Conn::new();
        let (rec, registry) = test_reconciler(&conn);
        let m = insert_machine(&conn, "m4.large", "");

        rec.run_once().await;
        let cloud = mock(&registry);
        cloud.clear_log();

        let row = conn.select::<Machine>(|r| r.id == m.id).remove(0);
        conn.txn(TableSet::of(&[TableKind::Machine]), |view| {
            view.remove(&row)
        });

        rec.run_once().await;
        assert_eq!(cloud.stops(), vec![row.cloud_id]);
        assert!(cloud.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cycle_assigns_floating_ip_to_new_machine() {
        // Booting and floating IP assignment land in the same cycle: the
        // second sync pass sees the machine the first pass booted.
        let conn = Conn::new();
        let (rec, registry) = test_reconciler(&conn);
        insert_machine(&conn, "m4.large", "198.51.100.7");

        rec.run_once().await;
        let cloud = mock(&registry);
        assert_eq!(cloud.boots().len(), 1);
        assert_eq!(cloud.ip_updates().len(), 1);
        assert_eq!(cloud.ip_updates()[0].floating_ip, "198.51.100.7");
        assert_eq!(cloud.list().await.unwrap()[0].floating_ip, "198.51.100.7");
    }

    #[tokio::test]
    async fn cycle_reassigns_changed_floating_ip() {
        let conn = Conn::new();
        let (rec, registry) = test_reconciler(&conn);
        let m = insert_machine(&conn, "m4.large", "");
        rec.run_once().await;
        let cloud = mock(&registry);
        cloud.clear_log();

        let mut row = conn.select::<Machine>(|r| r.id == m.id).remove(0);
        row.floating_ip = "198.51.100.9".into();
        conn.txn(TableSet::of(&[TableKind::Machine]), |view| {
            view.commit(row)
        });

        rec.run_once().await;
        assert_eq!(cloud.ip_updates().len(), 1);
        assert_eq!(cloud.ip_updates()[0].floating_ip, "198.51.100.9");
    }

    #[tokio::test]
    async fn cycle_pushes_acls() {
        let conn = Conn::new();
        let (rec, registry) = test_reconciler(&conn);
        conn.txn(TableSet::of(&[TableKind::AclRule]), |view| {
            let mut rule = view.insert::<AclRule>();
            rule.cidr_ip = "192.0.2.0/24".into();
            rule.min_port = 1;
            rule.max_port = 65535;
            view.commit(rule);
        });

        rec.run_once().await;
        let acls = mock(&registry).acls();
        assert!(acls.contains(&Acl {
            cidr_ip: "192.0.2.0/24".into(),
            min_port: 1,
            max_port: 65535,
        }));
        assert!(acls.contains(&Acl::full_range("5.6.7.8/32")));
    }

    #[tokio::test]
    async fn reconciler_rebuilds_on_namespace_change() {
        let conn = Conn::new();
        let (factory, _, created) = registry_factory();

        assert!(update_reconciler(&conn, None, &factory, None).is_none());

        let set_namespace = |ns: &str| {
            conn.txn(TableSet::of(&[TableKind::Cluster]), |view| {
                let mut cluster = match view.cluster() {
                    Ok(c) => c,
                    Err(_) => view.insert::<Cluster>(),
                };
                cluster.namespace = ns.into();
                cluster
                    .regions
                    .insert(Provider::Mock, vec![REGION.to_string()]);
                view.commit(cluster);
            });
        };

        set_namespace("ns1");
        let rec = update_reconciler(&conn, None, &factory, None);
        assert_eq!(rec.as_ref().map(Reconciler::namespace), Some("ns1"));
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // Same namespace: the reconciler is kept, nothing is rebuilt.
        let rec = update_reconciler(&conn, None, &factory, rec);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        set_namespace("ns2");
        let rec = update_reconciler(&conn, None, &factory, rec);
        assert_eq!(rec.as_ref().map(Reconciler::namespace), Some("ns2"));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn multi_region_converges() {
        let conn = Conn::new();
        let (factory, registry, _) = registry_factory();
        let mut regions = BTreeMap::new();
        regions.insert(Provider::Mock, vec!["r1".to_string(), "r2".to_string()]);
        let rec = Reconciler::new(conn.clone(), "ns", &regions, None, &factory);

        conn.txn(TableSet::of(&[TableKind::Machine]), |view| {
            for region in ["r1", "r2"] {
                let mut m = view.insert::<Machine>();
                m.provider = Provider::Mock;
                m.region = region.into();
                m.size = "size1".into();
                view.commit(m);
            }
        });

        rec.run_once().await;
        rec.run_once().await;

        let clouds: Vec<MockCloud> = registry.lock().unwrap().values().cloned().collect();
        let mut cloud_machines = Vec::new();
        for cloud in clouds {
            cloud_machines.extend(cloud.list().await.unwrap());
        }

        let plan = sync_machines(cloud_machines, conn.select::<Machine>(|_| true));
        assert!(plan.boot.is_empty());
        assert!(plan.stop.is_empty());
        assert_eq!(plan.pairs, 2);
    }
}

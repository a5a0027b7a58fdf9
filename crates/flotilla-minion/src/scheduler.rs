//! Container scheduling.
//!
//! Two halves share this module. On the leader master, `run_master`
//! assigns each desired container to a worker, honoring placement rules
//! and breaking ties toward the least-loaded machine. On every worker,
//! `run_worker` converges the local runtime on the containers assigned to
//! this node: surplus runtime containers are removed, missing ones are
//! started (bounded fan-out), and runtime identity is written back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use flotilla_db::{
    Conn, Container, Machine, Minion, Placement, Role, RowId, TableKind, TableSet,
};
use flotilla_join::score_join;

use crate::runtime::{ContainerRuntime, RunOptions, RuntimeContainer};

/// Label attached to every application container we start, so `list` can
/// tell our containers from unrelated ones.
pub const SCHEDULER_LABEL_KEY: &str = "flotilla";
pub const SCHEDULER_LABEL_VALUE: &str = "scheduler";

const CONCURRENT_STARTS: usize = 32;

/// The scheduler loop.
pub async fn run(
    conn: Conn,
    runtime: Arc<dyn ContainerRuntime>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut trigger = conn.trigger_tick(
        60,
        TableSet::of(&[
            TableKind::Minion,
            TableKind::Container,
            TableKind::Placement,
            TableKind::Etcd,
            TableKind::Machine,
        ]),
    );

    loop {
        match conn.minion_self() {
            Ok(own) if own.role == Role::Worker => {
                run_worker(&conn, runtime.clone(), &own.private_ip).await;
            }
            Ok(own) if own.role == Role::Master => {
                // Placement is written into the replicated Container
                // table, so only the leader's decisions may stand.
                if conn.etcd_leader() {
                    run_master(&conn);
                }
            }
            _ => {}
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

// ── Worker side ────────────────────────────────────────────────────

/// Converge the runtime on the containers assigned to this node.
pub async fn run_worker(conn: &Conn, runtime: Arc<dyn ContainerRuntime>, my_ip: &str) {
    if my_ip.is_empty() {
        return;
    }

    let running = match runtime
        .list(Some((SCHEDULER_LABEL_KEY, SCHEDULER_LABEL_VALUE)))
        .await
    {
        Ok(running) => running,
        Err(err) => {
            warn!(error = %err, "failed to list runtime containers");
            return;
        }
    };

    let my_ip_owned = my_ip.to_string();
    let desired = conn.select::<Container>(move |c| c.minion == my_ip_owned);

    let diff = score_join(desired, running, sync_score);

    for surplus in diff.rights {
        info!(container = %surplus.id, "removing surplus container");
        if let Err(err) = runtime.remove_id(&surplus.id).await {
            warn!(container = %surplus.id, error = %err, "failed to remove container");
        }
    }

    let mut pairs = diff.pairs;
    pairs.extend(boot_containers(runtime, diff.lefts).await);

    let changed: Vec<Container> = pairs
        .into_iter()
        .filter(|(dbc, rtc)| dbc.runtime_id != rtc.id)
        .map(|(mut dbc, rtc)| {
            dbc.runtime_id = rtc.id;
            dbc.pid = rtc.pid;
            dbc
        })
        .collect();
    if changed.is_empty() {
        return;
    }

    conn.txn(TableSet::of(&[TableKind::Container]), |view| {
        for updated in changed {
            // The row may have been removed while we were booting; only
            // touch rows that still exist.
            if !view.select::<Container>(|c| c.id == updated.id).is_empty() {
                view.commit(updated);
            }
        }
    });
}

/// Start the given containers with bounded parallelism, returning the
/// (desired, started) pairs that succeeded.
async fn boot_containers(
    runtime: Arc<dyn ContainerRuntime>,
    to_boot: Vec<Container>,
) -> Vec<(Container, RuntimeContainer)> {
    let semaphore = Arc::new(Semaphore::new(CONCURRENT_STARTS));
    let mut tasks = JoinSet::new();

    for dbc in to_boot {
        let runtime = runtime.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;

            info!(container = %dbc, "starting container");
            let opts = RunOptions {
                image: dbc.image.clone(),
                args: dbc.command.clone(),
                env: dbc.env.clone(),
                labels: [(
                    SCHEDULER_LABEL_KEY.to_string(),
                    SCHEDULER_LABEL_VALUE.to_string(),
                )]
                .into(),
                ..RunOptions::default()
            };

            let id = match runtime.run(opts).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(container = %dbc, error = %err, "failed to start container");
                    return None;
                }
            };
            match runtime.get(&id).await {
                Ok(rtc) => Some((dbc, rtc)),
                Err(err) => {
                    warn!(container = %dbc, error = %err, "failed to inspect started container");
                    None
                }
            }
        });
    }

    let mut pairs = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Some(pair)) = result {
            pairs.push(pair);
        }
    }
    pairs
}

/// How well a desired container matches a runtime container. Zero when
/// the recorded runtime ID also matches, a positive cost when only the
/// content does, impossible otherwise.
fn sync_score(dbc: &Container, rtc: &RuntimeContainer) -> Option<u32> {
    for (key, value) in &dbc.env {
        if rtc.env.get(key) != Some(value) {
            return None;
        }
    }

    if dbc.image != rtc.image {
        return None;
    }
    if !dbc.command.is_empty() && dbc.command != rtc.command {
        return None;
    }

    if dbc.runtime_id == rtc.id {
        Some(0)
    } else {
        Some(1)
    }
}

// ── Master side ────────────────────────────────────────────────────

/// Assign every desired container to a worker.
pub fn run_master(conn: &Conn) {
    conn.txn(
        TableSet::of(&[
            TableKind::Container,
            TableKind::Placement,
            TableKind::Minion,
            TableKind::Machine,
        ]),
        |view| {
            let mut workers = view.select::<Minion>(|m| {
                m.role == Role::Worker && !m.private_ip.is_empty()
            });
            workers.sort_by(|a, b| a.private_ip.cmp(&b.private_ip));

            let mut containers = view.rows::<Container>();
            containers.sort_by_key(|c| c.id);
            let placements = view.rows::<Placement>();
            let machines = view.rows::<Machine>();

            let assignments = place_containers(&workers, &machines, &containers, &placements);
            for container in containers {
                let assigned = assignments
                    .get(&container.id)
                    .cloned()
                    .unwrap_or_default();
                if container.minion != assigned {
                    debug!(container = %container, minion = %assigned, "placement changed");
                    let mut updated = container;
                    updated.minion = assigned;
                    view.commit(updated);
                }
            }
        },
    );
}

/// Compute a placement for each container. Containers that no worker may
/// host are left unassigned.
pub fn place_containers(
    workers: &[Minion],
    machines: &[Machine],
    containers: &[Container],
    placements: &[Placement],
) -> HashMap<RowId, String> {
    let mut assignments: HashMap<RowId, String> = HashMap::new();
    let mut load: HashMap<String, usize> = HashMap::new();
    // worker ip → label names currently hosted there, built as we assign.
    let mut hosted: HashMap<String, HashSet<String>> = HashMap::new();

    for container in containers {
        let rules: Vec<&Placement> = placements
            .iter()
            .filter(|p| container.labels.contains(&p.target_label))
            .collect();

        let candidate = workers
            .iter()
            .filter(|w| {
                rules
                    .iter()
                    .all(|rule| satisfies(rule, w, machines, &hosted))
            })
            .min_by_key(|w| {
                (
                    load.get(&w.private_ip).copied().unwrap_or(0),
                    w.private_ip.clone(),
                )
            });

        match candidate {
            Some(worker) => {
                let ip = worker.private_ip.clone();
                *load.entry(ip.clone()).or_insert(0) += 1;
                hosted
                    .entry(ip.clone())
                    .or_default()
                    .extend(container.labels.iter().cloned());
                assignments.insert(container.id, ip);
            }
            None => {
                warn!(container = %container, "no machine satisfies placement constraints");
            }
        }
    }

    assignments
}

/// Whether one placement rule allows this worker to host a container of
/// the rule's target label, given what has been assigned so far.
fn satisfies(
    rule: &Placement,
    worker: &Minion,
    machines: &[Machine],
    hosted: &HashMap<String, HashSet<String>>,
) -> bool {
    let matched = if !rule.other_label.is_empty() {
        hosted
            .get(&worker.private_ip)
            .is_some_and(|labels| labels.contains(&rule.other_label))
    } else if !rule.provider.is_empty() {
        worker.provider == rule.provider
    } else if !rule.region.is_empty() {
        worker.region == rule.region
    } else if !rule.size.is_empty() {
        worker.size == rule.size
    } else if !rule.floating_ip.is_empty() {
        machines
            .iter()
            .any(|m| m.floating_ip == rule.floating_ip && m.private_ip == worker.private_ip)
    } else {
        // A rule with no constraint restricts nothing.
        return true;
    };

    if rule.exclusive {
        !matched
    } else {
        matched
    }
}

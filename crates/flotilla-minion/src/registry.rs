//! Custom image builds.
//!
//! Leader-only: every Image row with no runtime ID yet is built from its
//! Dockerfile and pushed to the registry container running on this node.
//! The resulting ID is written back so the scheduler can place containers
//! that use the image.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use flotilla_db::{Conn, Image, Role, TableKind, TableSet};

use crate::runtime::ContainerRuntime;

const LOCAL_REGISTRY: &str = "localhost:5000";

/// The registry loop.
pub async fn run(
    conn: Conn,
    runtime: Arc<dyn ContainerRuntime>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut trigger = conn.trigger_tick(
        30,
        TableSet::of(&[TableKind::Image, TableKind::Etcd, TableKind::Minion]),
    );

    loop {
        let is_leader_master = matches!(
            conn.minion_self(),
            Ok(own) if own.role == Role::Master
        ) && conn.etcd_leader();
        if is_leader_master {
            run_once(&conn, runtime.as_ref()).await;
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

/// Build and push every image that has not been built yet.
pub async fn run_once(conn: &Conn, runtime: &dyn ContainerRuntime) {
    let to_build = conn.select::<Image>(|img| img.runtime_id.is_empty());

    for image in to_build {
        let registry_name = format!("{LOCAL_REGISTRY}/{}", image.name);
        let id = match runtime.build(&registry_name, &image.dockerfile).await {
            Ok(id) => id,
            Err(err) => {
                warn!(image = %image.name, error = %err, "image build failed");
                continue;
            }
        };
        if let Err(err) = runtime.push(LOCAL_REGISTRY, &registry_name).await {
            warn!(image = %image.name, error = %err, "image push failed");
            continue;
        }

        info!(image = %image.name, %id, "image built");
        conn.txn(TableSet::of(&[TableKind::Image]), |view| {
            // The row may have changed while we were building; only
            // record the ID on the exact image we built.
            let mut rows = view.select::<Image>(|row| {
                row.name == image.name && row.dockerfile == image.dockerfile
            });
            if let Some(mut row) = rows.pop() {
                row.runtime_id = id.clone();
                view.commit(row);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryRuntime;

    fn insert_image(conn: &Conn, name: &str, dockerfile: &str) {
        conn.txn(TableSet::of(&[TableKind::Image]), |view| {
            let mut image = view.insert::<Image>();
            image.name = name.into();
            image.dockerfile = dockerfile.into();
            view.commit(image);
        });
    }

    #[tokio::test]
    async fn builds_and_records_pending_images() {
        let conn = Conn::new();
        let runtime = MemoryRuntime::new();
        insert_image(&conn, "custom", "FROM alpine");

        run_once(&conn, &runtime).await;

        let image = conn.select::<Image>(|_| true).remove(0);
        assert!(!image.runtime_id.is_empty());
        assert_eq!(
            runtime.pushes(),
            vec![(
                "localhost:5000".to_string(),
                "localhost:5000/custom".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn built_images_are_not_rebuilt() {
        let conn = Conn::new();
        let runtime = MemoryRuntime::new();
        insert_image(&conn, "custom", "FROM alpine");

        run_once(&conn, &runtime).await;
        run_once(&conn, &runtime).await;

        assert_eq!(runtime.pushes().len(), 1);
    }
}

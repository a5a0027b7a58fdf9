//! The minion's gRPC server.
//!
//! The foreman configures this node through three RPCs: it reads the
//! current configuration back (role and version), pushes the desired
//! configuration into the self Minion row, and hands over the etcd member
//! set that parameterizes the coordination store.

use std::time::Duration;

use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use flotilla_db::{Conn, Etcd, TableKind, TableSet};
use flotilla_proto::{ConfigRequest, EtcdMembers, MinionConfig, Reply, VERSION};

/// Default port the minion server listens on.
pub const MINION_PORT: u16 = 9999;

const BIND_RETRY: Duration = Duration::from_secs(30);

/// The gRPC service backing the minion side of the foreman protocol.
pub struct MinionServer {
    conn: Conn,
}

impl MinionServer {
    pub fn new(conn: Conn) -> MinionServer {
        MinionServer { conn }
    }

    pub fn into_service(self) -> flotilla_proto::minion_server::MinionServer<MinionServer> {
        flotilla_proto::minion_server::MinionServer::new(self)
    }
}

#[tonic::async_trait]
impl flotilla_proto::minion_server::Minion for MinionServer {
    async fn get_minion_config(
        &self,
        _request: Request<ConfigRequest>,
    ) -> Result<Response<MinionConfig>, Status> {
        let config = match self.conn.minion_self() {
            Ok(own) => MinionConfig {
                role: flotilla_proto::Role::from(own.role) as i32,
                private_ip: own.private_ip,
                public_ip: own.public_ip,
                blueprint: own.blueprint,
                provider: own.provider,
                size: own.size,
                region: own.region,
                etcd_members: Vec::new(),
                authorized_keys: own.authorized_keys,
                version: VERSION.to_string(),
            },
            // Not configured yet; report an empty role so the foreman
            // knows to push.
            Err(_) => MinionConfig {
                version: VERSION.to_string(),
                ..MinionConfig::default()
            },
        };

        Ok(Response::new(config))
    }

    async fn set_minion_config(
        &self,
        request: Request<MinionConfig>,
    ) -> Result<Response<Reply>, Status> {
        let config = request.into_inner();

        self.conn.txn(
            TableSet::of(&[TableKind::Minion, TableKind::Etcd]),
            |view| {
                let mut own = match view.minion_self() {
                    Ok(own) => own,
                    Err(_) => {
                        info!("received initial configuration");
                        view.insert()
                    }
                };
                own.role = config.db_role();
                own.private_ip = config.private_ip.clone();
                own.public_ip = config.public_ip.clone();
                own.blueprint = config.blueprint.clone();
                own.provider = config.provider.clone();
                own.size = config.size.clone();
                own.region = config.region.clone();
                own.authorized_keys = config.authorized_keys.clone();
                own.self_node = true;
                view.commit(own);

                set_etcd_members(view, &config.etcd_members);
            },
        );

        Ok(Response::new(Reply {
            success: true,
            error: String::new(),
        }))
    }

    async fn boot_etcd(
        &self,
        request: Request<EtcdMembers>,
    ) -> Result<Response<Reply>, Status> {
        let members = request.into_inner();
        self.conn.txn(TableSet::of(&[TableKind::Etcd]), |view| {
            set_etcd_members(view, &members.ips);
        });

        Ok(Response::new(Reply {
            success: true,
            error: String::new(),
        }))
    }
}

/// Upsert the Etcd singleton with the sorted member set.
fn set_etcd_members(view: &mut flotilla_db::View, members: &[String]) {
    let mut sorted = members.to_vec();
    sorted.sort();

    let mut rows = view.rows::<Etcd>();
    let mut row = if rows.is_empty() {
        info!("received etcd membership");
        view.insert::<Etcd>()
    } else {
        rows.remove(0)
    };
    row.etcd_ips = sorted;
    view.commit(row);
}

/// Serve the minion API on the given port, retrying the bind until it
/// succeeds or shutdown is signaled.
pub async fn serve(conn: Conn, port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    loop {
        let service = MinionServer::new(conn.clone()).into_service();
        let mut signal = shutdown.clone();
        let result = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(addr, async move {
                let _ = signal.changed().await;
            })
            .await;

        match result {
            Ok(()) => return,
            Err(err) => {
                error!(%addr, error = %err, "minion server failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(BIND_RETRY) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_db::{Minion, Role};
    use flotilla_proto::minion_server::Minion as MinionService;

    fn test_config(role: flotilla_proto::Role) -> MinionConfig {
        MinionConfig {
            role: role as i32,
            private_ip: "10.0.0.1".into(),
            public_ip: "203.0.113.1".into(),
            blueprint: r#"{"namespace":"ns"}"#.into(),
            provider: "Mock".into(),
            size: "m4.large".into(),
            region: "r1".into(),
            etcd_members: vec!["10.0.0.2".into(), "10.0.0.1".into()],
            authorized_keys: "ssh-ed25519 AAAA".into(),
            version: VERSION.into(),
        }
    }

    #[tokio::test]
    async fn unconfigured_minion_reports_no_role() {
        let server = MinionServer::new(Conn::new());
        let config = server
            .get_minion_config(Request::new(ConfigRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(config.db_role(), Role::None);
        assert_eq!(config.version, VERSION);
    }

    #[tokio::test]
    async fn set_config_creates_the_self_row() {
        let conn = Conn::new();
        let server = MinionServer::new(conn.clone());

        server
            .set_minion_config(Request::new(test_config(flotilla_proto::Role::Worker)))
            .await
            .unwrap();

        let own = conn.minion_self().unwrap();
        assert!(own.self_node);
        assert_eq!(own.role, Role::Worker);
        assert_eq!(own.private_ip, "10.0.0.1");
        assert_eq!(own.blueprint, r#"{"namespace":"ns"}"#);

        // Membership arrived sorted.
        let etcd = conn.select::<Etcd>(|_| true).remove(0);
        assert_eq!(etcd.etcd_ips, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn set_config_round_trips_through_get() {
        let conn = Conn::new();
        let server = MinionServer::new(conn.clone());

        server
            .set_minion_config(Request::new(test_config(flotilla_proto::Role::Master)))
            .await
            .unwrap();

        let read_back = server
            .get_minion_config(Request::new(ConfigRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(read_back.db_role(), Role::Master);
        assert_eq!(read_back.public_ip, "203.0.113.1");
        assert_eq!(read_back.region, "r1");
    }

    #[tokio::test]
    async fn reconfiguration_updates_in_place() {
        let conn = Conn::new();
        let server = MinionServer::new(conn.clone());

        server
            .set_minion_config(Request::new(test_config(flotilla_proto::Role::Worker)))
            .await
            .unwrap();
        let first = conn.minion_self().unwrap();

        let mut updated = test_config(flotilla_proto::Role::Master);
        updated.size = "m4.xlarge".into();
        server
            .set_minion_config(Request::new(updated))
            .await
            .unwrap();

        let rows = conn.select::<Minion>(|m| m.self_node);
        assert_eq!(rows.len(), 1, "reconfiguration must not duplicate self");
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[0].role, Role::Master);
        assert_eq!(rows[0].size, "m4.xlarge");
    }

    #[tokio::test]
    async fn boot_etcd_sorts_members() {
        let conn = Conn::new();
        let server = MinionServer::new(conn.clone());

        server
            .boot_etcd(Request::new(EtcdMembers {
                ips: vec!["10.0.0.3".into(), "10.0.0.1".into(), "10.0.0.2".into()],
            }))
            .await
            .unwrap();

        let etcd = conn.select::<Etcd>(|_| true).remove(0);
        assert_eq!(etcd.etcd_ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }
}

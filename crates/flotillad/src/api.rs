//! The daemon's gRPC API: query tables, install blueprints.

use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::info;

use flotilla_db::{
    AclRule, Cluster, Conn, Connection, Container, Etcd, Hostname, Image, Label, Machine, Minion,
    Placement, Row, TableKind,
};
use flotilla_proto::{
    DbQuery, DeployReply, DeployRequest, QueryReply, RunReply, RunRequest,
};

pub struct ApiService {
    conn: Conn,
}

impl ApiService {
    pub fn new(conn: Conn) -> ApiService {
        ApiService { conn }
    }
}

#[tonic::async_trait]
impl flotilla_proto::api_server::Api for ApiService {
    async fn query(&self, request: Request<DbQuery>) -> Result<Response<QueryReply>, Status> {
        let table = request.into_inner().table;
        let kind = TableKind::parse(&table)
            .ok_or_else(|| Status::invalid_argument(format!("unrecognized table: {table}")))?;

        let table_contents = dump_table(&self.conn, kind)
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(QueryReply { table_contents }))
    }

    async fn deploy(
        &self,
        request: Request<DeployRequest>,
    ) -> Result<Response<DeployReply>, Status> {
        let blueprint = request.into_inner().blueprint;
        let parsed = flotilla_engine::deploy(&self.conn, &blueprint)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;

        info!(
            namespace = %parsed.namespace,
            machines = parsed.machines.len(),
            containers = parsed.containers.len(),
            "blueprint deployed"
        );
        Ok(Response::new(DeployReply {}))
    }

    async fn run(&self, request: Request<RunRequest>) -> Result<Response<RunReply>, Status> {
        // The policy compiler runs client-side; the payload is the same
        // compiled document Deploy takes.
        let blueprint = request.into_inner().blueprint;
        flotilla_engine::deploy(&self.conn, &blueprint)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        Ok(Response::new(RunReply {}))
    }
}

fn dump_table(conn: &Conn, kind: TableKind) -> serde_json::Result<String> {
    fn dump<R: Row + serde::Serialize>(conn: &Conn) -> serde_json::Result<String> {
        serde_json::to_string(&conn.select::<R>(|_| true))
    }

    match kind {
        TableKind::Cluster => dump::<Cluster>(conn),
        TableKind::Machine => dump::<Machine>(conn),
        TableKind::Container => dump::<Container>(conn),
        TableKind::Minion => dump::<Minion>(conn),
        TableKind::Connection => dump::<Connection>(conn),
        TableKind::Label => dump::<Label>(conn),
        TableKind::Etcd => dump::<Etcd>(conn),
        TableKind::Placement => dump::<Placement>(conn),
        TableKind::AclRule => dump::<AclRule>(conn),
        TableKind::Image => dump::<Image>(conn),
        TableKind::Hostname => dump::<Hostname>(conn),
    }
}

/// Where the API server listens, parsed from `proto://addr`.
pub enum ListenAddr {
    Tcp(std::net::SocketAddr),
    Unix(PathBuf),
}

pub fn parse_listen(addr: &str) -> anyhow::Result<ListenAddr> {
    match addr.split_once("://") {
        Some(("tcp", rest)) => Ok(ListenAddr::Tcp(
            rest.parse().context("invalid tcp listen address")?,
        )),
        Some(("unix", path)) => Ok(ListenAddr::Unix(PathBuf::from(path))),
        _ => anyhow::bail!("listen address must look like unix://<path> or tcp://<host:port>"),
    }
}

/// Serve the API until shutdown. Fails fast on bind errors so a daemon
/// that cannot listen exits non-zero.
pub async fn serve(
    conn: Conn,
    listen: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let service = flotilla_proto::api_server::ApiServer::new(ApiService::new(conn));
    let signal = async move {
        let _ = shutdown.changed().await;
    };

    match parse_listen(listen)? {
        ListenAddr::Tcp(addr) => {
            info!(%addr, "API server listening");
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_shutdown(addr, signal)
                .await
                .context("API server failed")?;
        }
        ListenAddr::Unix(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            // A previous run may have left its socket behind.
            let _ = std::fs::remove_file(&path);

            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("binding {}", path.display()))?;
            info!(path = %path.display(), "API server listening");

            let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, signal)
                .await
                .context("API server failed")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_db::TableSet;
    use flotilla_proto::api_server::Api;

    #[tokio::test]
    async fn query_serializes_a_table() {
        let conn = Conn::new();
        conn.txn(TableSet::of(&[TableKind::Machine]), |view| {
            let mut m = view.insert::<Machine>();
            m.size = "m4.large".into();
            view.commit(m);
        });

        let api = ApiService::new(conn);
        let reply = api
            .query(Request::new(DbQuery {
                table: "machine".into(),
            }))
            .await
            .unwrap()
            .into_inner();

        let rows: Vec<Machine> = serde_json::from_str(&reply.table_contents).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size, "m4.large");
    }

    #[tokio::test]
    async fn query_rejects_unknown_tables() {
        let api = ApiService::new(Conn::new());
        let status = api
            .query(Request::new(DbQuery {
                table: "nonsense".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn deploy_validates_and_installs() {
        let conn = Conn::new();
        let api = ApiService::new(conn.clone());

        let status = api
            .deploy(Request::new(DeployRequest {
                blueprint: "not json".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        api.deploy(Request::new(DeployRequest {
            blueprint: r#"{"Namespace": "ns", "Machines": [
                {"Provider": "Mock", "Size": "m4.large", "Role": "Master"}
            ]}"#
            .into(),
        }))
        .await
        .unwrap();

        let cluster = conn
            .txn(TableSet::of(&[TableKind::Cluster]), |view| view.cluster())
            .unwrap();
        assert_eq!(cluster.namespace, "ns");
    }

    #[test]
    fn listen_addresses_parse() {
        assert!(matches!(
            parse_listen("tcp://127.0.0.1:9000"),
            Ok(ListenAddr::Tcp(_))
        ));
        assert!(matches!(
            parse_listen("unix:///var/run/flotilla.sock"),
            Ok(ListenAddr::Unix(_))
        ));
        assert!(parse_listen("ftp://nope").is_err());
        assert!(parse_listen("no-scheme").is_err());
    }
}

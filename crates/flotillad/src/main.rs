//! flotillad — the flotilla daemon.
//!
//! One binary, two modes:
//!
//! - **daemon** — the cluster brain: compiles blueprints into desired
//!   state, reconciles cloud providers, and configures minions.
//! - **minion** — the per-machine agent: system containers, container
//!   scheduling, and overlay network programming.
//!
//! # Usage
//!
//! ```text
//! flotillad daemon --listen unix:///var/run/flotilla.sock
//! flotillad minion --role worker --port 9999
//! ```

mod api;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use flotilla_db::{Conn, Role};

#[derive(Parser)]
#[command(name = "flotillad", about = "Multi-cloud container orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cluster daemon.
    Daemon {
        /// Listen address for the API server (unix://<path> or
        /// tcp://<host:port>).
        #[arg(long, default_value = "unix:///var/run/flotilla.sock")]
        listen: String,

        /// Public IP of this host, opened in every provider firewall.
        #[arg(long)]
        advertise_ip: Option<String>,

        /// Port minions listen on.
        #[arg(long, default_value_t = flotilla_minion::server::MINION_PORT)]
        minion_port: u16,
    },

    /// Run the per-machine agent.
    Minion {
        /// The role this machine plays.
        #[arg(long, value_enum)]
        role: MinionRole,

        /// Port for the minion configuration server.
        #[arg(long, default_value_t = flotilla_minion::server::MINION_PORT)]
        port: u16,

        /// Path of the authorized_keys file to keep in sync.
        #[arg(long, default_value = "/home/flotilla/.ssh/authorized_keys")]
        authorized_keys: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MinionRole {
    Master,
    Worker,
}

impl From<MinionRole> for Role {
    fn from(role: MinionRole) -> Role {
        match role {
            MinionRole::Master => Role::Master,
            MinionRole::Worker => Role::Worker,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flotilla=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Daemon {
            listen,
            advertise_ip,
            minion_port,
        } => run_daemon(listen, advertise_ip, minion_port).await,
        Command::Minion {
            role,
            port,
            authorized_keys,
        } => run_minion(role.into(), port, authorized_keys).await,
    }
}

async fn run_daemon(
    listen: String,
    advertise_ip: Option<String>,
    minion_port: u16,
) -> anyhow::Result<()> {
    info!(version = flotilla_proto::VERSION, "flotilla daemon starting");

    let conn = Conn::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(flotilla_engine::run(conn.clone(), shutdown_rx.clone()));
    tokio::spawn(flotilla_cloud::run(
        conn.clone(),
        advertise_ip,
        flotilla_cloud::default_factory(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(flotilla_foreman::run(
        conn.clone(),
        Arc::new(flotilla_foreman::GrpcDialer { port: minion_port }),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    api::serve(conn, &listen, shutdown_rx).await?;
    info!("flotilla daemon stopped");
    Ok(())
}

async fn run_minion(role: Role, port: u16, authorized_keys: PathBuf) -> anyhow::Result<()> {
    info!(version = flotilla_proto::VERSION, %role, "flotilla minion starting");

    let conn = Conn::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The coordination store, container runtime, and overlay store are
    // external collaborators; their bindings plug in at these seams. The
    // in-memory implementations make a single node self-contained.
    let store = Arc::new(flotilla_store::MemoryStore::new());
    let runtime = Arc::new(flotilla_minion::runtime::MemoryRuntime::new());
    let overlay = Arc::new(flotilla_minion::network::MemoryOverlay::new());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    flotilla_minion::run(
        conn,
        store,
        runtime,
        overlay,
        flotilla_minion::MinionOptions {
            role,
            port,
            authorized_keys_path: authorized_keys,
        },
        shutdown_rx,
    )
    .await;

    info!("flotilla minion stopped");
    Ok(())
}

//! Gateway cluster node daemon.
//!
//! Bootstraps the node into its cluster in the background and serves the
//! admin API.  SIGTERM/SIGINT stop the listener, then the cluster is closed
//! gracefully: loops stopped, session, client and server torn down.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use gateway_cluster::cluster::etcd::{EtcdConnector, EtcdLauncher};
use gateway_cluster::cluster::memory::MemoryStore;
use gateway_cluster::cluster::store::{ServerLauncher, StoreConnector};
use gateway_cluster::cluster::{Cluster, Readiness};
use gateway_cluster::config::LoggingConfig;

/// Command-line arguments for the gateway cluster node.
#[derive(Parser, Debug)]
#[command(
    name = "gateway-cluster",
    version,
    about = "Gateway cluster coordination node"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "gateway-cluster.example.yaml")]
    config: String,

    /// Override the admin bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = gateway_cluster::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        gateway_cluster::metrics::init_metrics();
        gateway_cluster::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let (connector, launcher): (Arc<dyn StoreConnector>, Option<Arc<dyn ServerLauncher>>) =
        match config.cluster.engine.as_str() {
            "etcd" => {
                let connector: Arc<dyn StoreConnector> = EtcdConnector::new(&config.cluster);
                let launcher = if config.cluster.role.is_writer() {
                    let launcher: Arc<dyn ServerLauncher> =
                        EtcdLauncher::new(config.cluster.etcd.binary.clone());
                    Some(launcher)
                } else {
                    None
                };
                info!(binary = %config.cluster.etcd.binary, "etcd store engine initialized");
                (connector, launcher)
            }
            // Single-process engine: every node started this way is its own cluster.
            "memory" => {
                let store = MemoryStore::new();
                let connector: Arc<dyn StoreConnector> = store.connector();
                let launcher: Arc<dyn ServerLauncher> = store.launcher();
                info!("In-process memory store engine initialized");
                (connector, Some(launcher))
            }
            other => anyhow::bail!("unknown cluster.engine '{other}'"),
        };

    let cluster = Cluster::new(config.cluster.clone(), connector, launcher)?;

    let state = Arc::new(gateway_cluster::AppState {
        config: config.clone(),
        cluster: Arc::clone(&cluster),
    });
    let app = gateway_cluster::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Admin API listening on {}", bind_addr);

    let shutdown = {
        let cluster = Arc::clone(&cluster);
        async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = wait_fatal(cluster) => {}
            }
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let timeout = Duration::from_secs(config.server.shutdown_timeout);
    if tokio::time::timeout(timeout, cluster.close()).await.is_err() {
        warn!("cluster close did not finish within {timeout:?}");
    }

    if let Readiness::Fatal(e) = cluster.readiness() {
        anyhow::bail!("cluster bootstrap failed: {e}");
    }
    info!("Gateway cluster node shut down");
    Ok(())
}

/// Install the tracing subscriber; `RUST_LOG` overrides `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve once bootstrap fails fatally; never resolves otherwise.
async fn wait_fatal(cluster: Arc<Cluster>) {
    match cluster.wait_ready().await {
        Err(e) if e.is_fatal() => error!("fatal cluster error, shutting down: {e}"),
        _ => std::future::pending::<()>().await,
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}

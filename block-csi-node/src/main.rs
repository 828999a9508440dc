//! Block CSI Node Plugin
//!
//! Node half of a Kubernetes CSI driver for SAN block storage. Serves the
//! CSI Identity and Node services on a local socket and stages iSCSI LUNs
//! published by the controller.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use block_csi_node::config::DriverConfig;
use block_csi_node::csi::identity_server::IdentityServer;
use block_csi_node::csi::node_server::NodeServer;
use block_csi_node::{IdentityService, NodeService, metrics};

/// CLI arguments for the node plugin
#[derive(Parser, Debug)]
#[command(name = "block-csi-node")]
#[command(about = "CSI node plugin for iSCSI block storage")]
struct Args {
    /// CSI endpoint (unix:///path/to/socket or tcp://host:port)
    #[arg(long, default_value = "unix:///csi/csi.sock")]
    csi_endpoint: String,

    /// Path to the driver config YAML file
    #[arg(long, default_value = "./common/config.yaml")]
    config_file_path: PathBuf,

    /// Node hostname used in the node id
    #[arg(long, env = "KUBE_NODE_NAME")]
    hostname: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics listen address (e.g. 0.0.0.0:9090)
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print driver name and version as JSON and exit
    #[arg(long)]
    version: bool,
}

/// Where the gRPC server listens.
enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

fn parse_endpoint(endpoint: &str) -> Result<Endpoint, String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(format!("Empty socket path in endpoint '{}'", endpoint));
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        let addr = addr
            .parse()
            .map_err(|e| format!("Invalid TCP endpoint '{}': {}", endpoint, e))?;
        return Ok(Endpoint::Tcp(addr));
    }
    Err(format!(
        "Unsupported endpoint '{}', expected unix:// or tcp://",
        endpoint
    ))
}

/// Bind a unix socket, replacing a stale socket file from a previous run.
fn bind_unix(path: &Path) -> Result<UnixListener, Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("Failed to remove {}: {}", path.display(), e).into()),
    }
    Ok(UnixListener::bind(path)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = DriverConfig::load(&args.config_file_path)?;
    if args.version {
        println!("{}", config.version_json()?);
        return Ok(());
    }

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let hostname = match args.hostname {
        Some(name) => name,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %config.identity.name,
        driver_version = %config.identity.version,
        endpoint = %args.csi_endpoint,
        hostname = %hostname,
        config = %args.config_file_path.display(),
        "Starting block CSI node plugin"
    );

    let config = Arc::new(config);
    let identity = IdentityService::from_config(&config.identity);
    let node = NodeService::new(hostname, config);

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node));

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    match parse_endpoint(&args.csi_endpoint)? {
        Endpoint::Unix(path) => {
            let listener = bind_unix(&path)?;
            info!(socket = %path.display(), "Serving CSI on unix socket");
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await?;
        }
        Endpoint::Tcp(addr) => {
            info!(addr = %addr, "Serving CSI on TCP");
            router.serve_with_shutdown(addr, shutdown).await?;
        }
    }

    info!("Block CSI node plugin shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{Signal, SignalKind, signal};

    async fn recv_or_pending(sig: Option<Signal>) {
        match sig {
            Some(mut sig) => {
                sig.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    let install = |kind: SignalKind, name: &str| match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install {} handler: {}", name, e);
            None
        }
    };

    let sigterm = install(SignalKind::terminate(), "SIGTERM");
    let sigint = install(SignalKind::interrupt(), "SIGINT");
    let sighup = install(SignalKind::hangup(), "SIGHUP");

    // Handlers that failed to install never fire
    tokio::select! {
        _ = recv_or_pending(sigterm) => info!("Received SIGTERM"),
        _ = recv_or_pending(sigint) => info!("Received SIGINT"),
        _ = recv_or_pending(sighup) => info!("Received SIGHUP, shutting down"),
    }
}

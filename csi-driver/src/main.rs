//! Cloud Block Storage CSI Driver
//!
//! Kubernetes CSI driver backed by a remote block-storage control plane.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use cloudblock_csi::identity::{DEFAULT_DRIVER_NAME, DRIVER_VERSION};
use cloudblock_csi::{Driver, DriverConfig, HttpControlPlane, LinuxMounter, metrics};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "cloudblock-csi")]
#[command(about = "Cloud block storage CSI driver for Kubernetes")]
#[command(disable_version_flag = true)]
struct Args {
    /// CSI endpoint (unix:///path/to/socket or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///tmp/csi.sock")]
    endpoint: String,

    /// Driver name
    #[arg(long = "drivername", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Node ID for this CSI node
    #[arg(long = "nodeid", env = "NODE_ID")]
    node_id: Option<String>,

    /// Driver version reported to the orchestrator
    #[arg(long, default_value = DRIVER_VERSION)]
    version: String,

    /// Control-plane API base URL
    #[arg(long, env = "CLOUD_API_URL", default_value = "https://api.cloudblock.io")]
    api_url: String,

    /// Control-plane API key (sent as a bearer token)
    #[arg(long, env = "CLOUD_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

/// Resolve the node ID: the flag wins unless it was given empty, then `NODE_ID`.
fn resolve_node_id(flag: Option<String>, env: Option<String>) -> Option<String> {
    flag.filter(|id| !id.is_empty())
        .or_else(|| env.filter(|id| !id.is_empty()))
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("cloudblock-csi: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

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

    let node_id = resolve_node_id(args.node_id, std::env::var("NODE_ID").ok())
        .ok_or("node ID is required (--nodeid or NODE_ID)")?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    info!(
        driver_name = %args.driver_name,
        version = %args.version,
        endpoint = %args.endpoint,
        node_id = %node_id,
        api_url = %args.api_url,
        api_key_configured = args.api_key.as_deref().is_some_and(|k| !k.is_empty()),
        "Starting cloud block storage CSI driver"
    );

    let control_plane = HttpControlPlane::new(&args.api_url, args.api_key)?;

    let driver = Arc::new(Driver::new(
        DriverConfig {
            driver_name: args.driver_name,
            version: args.version,
            node_id,
            endpoint: args.endpoint,
        },
        Arc::new(LinuxMounter::new()),
        Arc::new(control_plane),
    ));

    let stopper = Arc::clone(&driver);
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.stop();
    });

    driver.run().await?;

    info!("cloudblock-csi shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    tokio::select! {
        Some(_) = recv(sigterm.as_mut()), if sigterm.is_some() => {
            info!("Received SIGTERM");
        }
        Some(_) = recv(sigint.as_mut()), if sigint.is_some() => {
            info!("Received SIGINT");
        }
        else => {
            // No handler could be installed; run until the server itself stops
            std::future::pending::<()>().await;
        }
    }
}

async fn recv(stream: Option<&mut signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(s) => s.recv().await,
        None => None,
    }
}

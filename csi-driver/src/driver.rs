//! CSI driver aggregate and gRPC server lifecycle
//!
//! [`Driver`] owns the three CSI services and serves them on the configured
//! endpoint until [`Driver::stop`] is called or the listener fails.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tracing::{debug, info, warn};

use crate::cloud::ControlPlane;
use crate::controller::ControllerService;
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::endpoint::{Endpoint, EndpointError, Scheme};
use crate::identity::IdentityService;
use crate::mount::Mounter;
use crate::node::NodeService;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// How long open connections get to finish in-flight RPCs after a stop.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Static driver configuration, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// CSI driver name reported by GetPluginInfo
    pub driver_name: String,
    /// Vendor version reported by GetPluginInfo
    pub version: String,
    /// Node identifier reported by NodeGetInfo
    pub node_id: String,
    /// `unix://<path>` or `tcp://<host:port>`
    pub endpoint: String,
}

type ServeFuture = Pin<Box<dyn Future<Output = std::result::Result<(), tonic::transport::Error>> + Send>>;

/// CSI Driver
///
/// Registers the Identity, Controller and Node services on a single gRPC
/// server. The same binary runs as controller and node plugin; the
/// orchestrator decides which RPCs it sends.
pub struct Driver {
    config: DriverConfig,
    identity: Arc<IdentityService>,
    controller: Arc<ControllerService>,
    node: Arc<NodeService>,
    shutdown: watch::Sender<bool>,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        mounter: Arc<dyn Mounter>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        let identity = Arc::new(IdentityService::new(
            config.driver_name.clone(),
            config.version.clone(),
        ));
        let controller = Arc::new(ControllerService::new(control_plane));
        let node = Arc::new(NodeService::new(config.node_id.clone(), mounter));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            identity,
            controller,
            node,
            shutdown,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Serve the CSI services on the configured endpoint.
    ///
    /// Returns `Ok(())` once [`Driver::stop`] has been called, or an error if
    /// the endpoint is invalid, the listener cannot be bound, or serving fails.
    pub async fn run(&self) -> Result<()> {
        let endpoint = Endpoint::parse(&self.config.endpoint)?;
        let mut stopped = self.shutdown.subscribe();
        let mut grace = self.shutdown.subscribe();

        let router = Server::builder()
            .add_service(IdentityServer::from_arc(Arc::clone(&self.identity)))
            .add_service(ControllerServer::from_arc(Arc::clone(&self.controller)))
            .add_service(NodeServer::from_arc(Arc::clone(&self.node)));

        // Stops accepting and sends GOAWAY on every open connection
        let signal = async move {
            let _ = stopped.wait_for(|stop| *stop).await;
            info!("Stop requested, shutting down gRPC server");
        };

        let serve: ServeFuture = match endpoint.scheme {
            Scheme::Unix => {
                remove_stale_socket(&endpoint.address)?;
                let listener = UnixListener::bind(&endpoint.address)?;
                Box::pin(
                    router.serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal),
                )
            }
            Scheme::Tcp => {
                let listener = TcpListener::bind(&endpoint.address).await?;
                Box::pin(
                    router.serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal),
                )
            }
        };

        info!(
            driver_name = %self.config.driver_name,
            version = %self.config.version,
            node_id = %self.config.node_id,
            endpoint = %endpoint,
            "CSI driver listening"
        );

        tokio::select! {
            result = serve => result?,
            _ = async {
                let _ = grace.wait_for(|stop| *stop).await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                warn!(
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "In-flight RPCs did not finish in time, abandoning them"
                );
            }
        }

        info!("CSI driver stopped");
        Ok(())
    }

    /// Stop a running server.
    ///
    /// The listener is closed and every open connection is told to go away,
    /// so no new RPCs are accepted on any connection. `run` returns once the
    /// connections have closed, or after [`SHUTDOWN_GRACE`] if an RPC is
    /// still running. Calling this before `run` makes `run` return as soon
    /// as its listener is bound.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Remove a socket file left behind by a previous instance.
fn remove_stale_socket(path: &str) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path, "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

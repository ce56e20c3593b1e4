//! Control-plane client interface
//!
//! The Controller service only needs five operations from the remote block
//! storage control plane. They are expressed as the [`ControlPlane`] trait so
//! the driver can be exercised without a network; [`http::HttpControlPlane`]
//! is the production implementation.

pub mod http;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("control plane returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid control plane URL '{0}'")]
    InvalidUrl(String),

    #[error("invalid response from control plane: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// A volume as reported back by the control plane after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVolume {
    /// Opaque control-plane identifier, used as the CSI volume ID
    pub volume_id: String,
    /// Size actually provisioned, in GiB
    pub size_gb: i64,
}

/// The subset of the control-plane API the driver depends on.
///
/// Implementations report every failure as a [`ControlPlaneError`]; the
/// driver never retries, the orchestrator does.
#[tonic::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Provision a new volume of `size_gb` GiB.
    async fn create_volume(&self, name: &str, size_gb: i64) -> Result<CreatedVolume>;

    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Resolve a node name (or an instance ID) to the control-plane instance ID.
    async fn get_instance(&self, node: &str) -> Result<String>;

    /// Attach a volume to an instance, requesting `device` as the guest device path.
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;

    /// Detach a volume from whichever instance it is attached to.
    async fn detach_volume(&self, volume_id: &str) -> Result<()>;
}

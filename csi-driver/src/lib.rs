//! Cloud Block Storage CSI Driver Library
//!
//! Kubernetes CSI driver that provisions and attaches volumes through a remote
//! block-storage control plane and mounts them on worker nodes.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - An HTTP client for the control-plane API
//! - Host mount operations behind the `Mounter` trait
//! - The gRPC server lifecycle (`Driver`)

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod cloud;
pub mod controller;
pub mod driver;
pub mod endpoint;
pub mod identity;
pub mod metrics;
pub mod mount;
pub mod node;

pub use cloud::ControlPlane;
pub use cloud::http::HttpControlPlane;
pub use controller::ControllerService;
pub use driver::{Driver, DriverConfig, DriverError};
pub use endpoint::Endpoint;
pub use identity::IdentityService;
pub use mount::Mounter;
pub use mount::linux::LinuxMounter;
pub use node::NodeService;

//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.

use tonic::{Request, Response, Status};

use crate::csi;

pub const DEFAULT_DRIVER_NAME: &str = "csi.cloudblock.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing
pub struct IdentityService {
    name: String,
    version: String,
}

impl IdentityService {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVER_NAME, DRIVER_VERSION)
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::Service(
                csi::plugin_capability::Service {
                    r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                },
            )),
        }];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// Probes the plugin to check if it is ready.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        // The plugin is ready when this service is running
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}

//! CSI Controller Service Implementation
//!
//! Handles volume lifecycle and attachment by calling the remote control plane.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::cloud::{ControlPlane, ControlPlaneError};
use crate::csi;
use crate::metrics::OperationTimer;

/// One GiB in bytes; the control plane sizes volumes in whole GiB.
pub const GIB: i64 = 1024 * 1024 * 1024;

/// Volume size used when the request carries no capacity range.
pub const DEFAULT_VOLUME_SIZE_GB: i64 = 10;

/// Guest device path requested on attach and handed to the node in the
/// publish context. The control plane attaches one data volume per instance.
pub const DEFAULT_DEVICE: &str = "/dev/vdb";

/// Publish-context key carrying the device path.
pub const PUBLISH_CONTEXT_DEVICE_KEY: &str = "device";

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation and deletion
/// - Attaching volumes to and detaching them from instances
/// - Capability reporting
///
/// Holds no state besides the control-plane client: the control plane is the
/// system of record, so concurrent RPCs need no coordination here.
pub struct ControllerService {
    control_plane: Arc<dyn ControlPlane>,
}

impl ControllerService {
    /// Create a new ControllerService backed by the given control plane.
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    /// Requested volume size in GiB.
    ///
    /// `required_bytes` is rounded down to whole GiB and clamped to at least
    /// 1 GiB (CSI allows a zero capacity range, the control plane does not).
    fn volume_size_gb(capacity_range: Option<&csi::CapacityRange>) -> i64 {
        match capacity_range {
            Some(range) => (range.required_bytes / GIB).max(1),
            None => DEFAULT_VOLUME_SIZE_GB,
        }
    }

    fn rpc_capability(
        rpc: csi::controller_service_capability::rpc::Type,
    ) -> csi::ControllerServiceCapability {
        csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: rpc as i32 },
            )),
        }
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();

        let result = async {
            let name = &req.name;
            if name.is_empty() {
                return Err(Status::invalid_argument("Volume name is required"));
            }

            let size_gb = Self::volume_size_gb(req.capacity_range.as_ref());
            info!(name = %name, size_gb, "CreateVolume request");

            let created = self
                .control_plane
                .create_volume(name, size_gb)
                .await
                .map_err(|e| {
                    error!(name = %name, error = %e, "Failed to create volume");
                    Status::internal(format!("failed to create volume {}: {}", name, e))
                })?;

            // Report what the control plane actually provisioned when it says so
            let provisioned_gb = if created.size_gb > 0 {
                created.size_gb
            } else {
                size_gb
            };

            info!(
                name = %name,
                volume_id = %created.volume_id,
                size_gb = provisioned_gb,
                "Volume created successfully"
            );

            Ok(Response::new(csi::CreateVolumeResponse {
                volume: Some(csi::Volume {
                    capacity_bytes: provisioned_gb.saturating_mul(GIB),
                    volume_id: created.volume_id,
                    ..Default::default()
                }),
            }))
        }
        .await;

        timer.observe(result)
    }

    /// Delete a volume.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();

        let result = async {
            let volume_id = &req.volume_id;
            if volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }

            info!(volume_id = %volume_id, "DeleteVolume request");

            match self.control_plane.delete_volume(volume_id).await {
                Ok(()) => {}
                // Already gone: deletion is idempotent
                Err(ControlPlaneError::NotFound(_)) => {
                    warn!(volume_id = %volume_id, "Volume not found, treating as already deleted");
                }
                Err(e) => {
                    error!(volume_id = %volume_id, error = %e, "Failed to delete volume");
                    return Err(Status::internal(format!(
                        "failed to delete volume {}: {}",
                        volume_id, e
                    )));
                }
            }

            info!(volume_id = %volume_id, "Volume deleted successfully");
            Ok(Response::new(csi::DeleteVolumeResponse {}))
        }
        .await;

        timer.observe(result)
    }

    /// Attach a volume to the instance backing a node.
    ///
    /// The orchestrator names nodes its own way; the control plane resolves
    /// that name (or an instance ID) to its instance identifier on every call.
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_publish_volume");
        let req = request.into_inner();

        let result = async {
            let volume_id = &req.volume_id;
            let node_id = &req.node_id;

            if volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }
            if node_id.is_empty() {
                return Err(Status::invalid_argument("Node ID is required"));
            }

            info!(volume_id = %volume_id, node_id = %node_id, "ControllerPublishVolume request");

            let instance_id = self.control_plane.get_instance(node_id).await.map_err(|e| {
                error!(node_id = %node_id, error = %e, "Failed to resolve node");
                Status::internal(format!("failed to resolve node {}: {}", node_id, e))
            })?;

            self.control_plane
                .attach_volume(volume_id, &instance_id, DEFAULT_DEVICE)
                .await
                .map_err(|e| {
                    error!(
                        volume_id = %volume_id,
                        instance_id = %instance_id,
                        error = %e,
                        "Failed to attach volume"
                    );
                    Status::internal(format!(
                        "failed to attach volume {} to instance {}: {}",
                        volume_id, instance_id, e
                    ))
                })?;

            info!(
                volume_id = %volume_id,
                node_id = %node_id,
                instance_id = %instance_id,
                device = DEFAULT_DEVICE,
                "Volume attached successfully"
            );

            let publish_context = HashMap::from([(
                PUBLISH_CONTEXT_DEVICE_KEY.to_string(),
                DEFAULT_DEVICE.to_string(),
            )]);

            Ok(Response::new(csi::ControllerPublishVolumeResponse { publish_context }))
        }
        .await;

        timer.observe(result)
    }

    /// Detach a volume from whichever instance holds it.
    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_unpublish_volume");
        let req = request.into_inner();

        let result = async {
            let volume_id = &req.volume_id;
            if volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }

            info!(volume_id = %volume_id, node_id = %req.node_id, "ControllerUnpublishVolume request");

            match self.control_plane.detach_volume(volume_id).await {
                Ok(()) => {}
                Err(ControlPlaneError::NotFound(_)) => {
                    warn!(volume_id = %volume_id, "Volume or attachment not found, treating as detached");
                }
                Err(e) => {
                    error!(volume_id = %volume_id, error = %e, "Failed to detach volume");
                    return Err(Status::internal(format!(
                        "failed to detach volume {}: {}",
                        volume_id, e
                    )));
                }
            }

            info!(volume_id = %volume_id, "Volume detached successfully");
            Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
        }
        .await;

        timer.observe(result)
    }

    /// Confirm the requested capabilities.
    ///
    /// Every request is echoed back as confirmed: the driver serves
    /// single-writer mounted volumes and the orchestrator only asks for those.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %req.volume_id, "ValidateVolumeCapabilities request");

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = vec![
            Self::rpc_capability(Type::CreateDeleteVolume),
            Self::rpc_capability(Type::PublishUnpublishVolume),
        ];

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    async fn get_snapshot(
        &self,
        _request: Request<csi::GetSnapshotRequest>,
    ) -> Result<Response<csi::GetSnapshotResponse>, Status> {
        Err(Status::unimplemented("GetSnapshot is not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerExpandVolume is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerGetVolume is not supported",
        ))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerModifyVolume is not supported",
        ))
    }
}

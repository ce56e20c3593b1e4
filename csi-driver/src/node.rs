//! CSI Node Service Implementation
//!
//! Handles volume staging and publishing on worker nodes: the attached block
//! device is formatted and mounted once per node at the staging path, then
//! bind-mounted into each consumer's target path.
//!
//! All host operations go through the [`Mounter`] trait.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::controller::PUBLISH_CONTEXT_DEVICE_KEY;
use crate::csi;
use crate::metrics::OperationTimer;
use crate::mount::{self, Mounter};

/// Permission bits for staging and target directories.
const MOUNT_DIR_MODE: u32 = 0o750;

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (format if needed, mount the device to the staging path)
/// - Volume unstaging (unmount from staging path)
/// - Volume publishing (bind mount from staging to target path)
/// - Volume unpublishing (unmount from target path)
/// - Node capability reporting
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    mounter: Arc<dyn Mounter>,
}

impl NodeService {
    /// Create a new NodeService with the specified node ID.
    pub fn new(node_id: impl Into<String>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            node_id: node_id.into(),
            mounter,
        }
    }

    /// Validate a host path received from the orchestrator.
    fn validate_path(what: &str, path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument(format!("{} is required", what)));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument(format!(
                "{} must be absolute: {}",
                what, path
            )));
        }

        if path.split('/').any(|component| component == "..") {
            return Err(Status::invalid_argument(format!(
                "{} cannot contain '..': {}",
                what, path
            )));
        }

        Ok(())
    }

    /// Filesystem requested by the volume capability.
    ///
    /// A missing capability or access type selects the default filesystem;
    /// raw block access is rejected since volumes are always mounted.
    fn requested_fs_type(
        capability: Option<&csi::VolumeCapability>,
    ) -> Result<&'static str, Status> {
        use csi::volume_capability::AccessType;

        let fs_type = match capability.and_then(|c| c.access_type.as_ref()) {
            Some(AccessType::Mount(m)) => m.fs_type.as_str(),
            Some(AccessType::Block(_)) => {
                return Err(Status::invalid_argument(
                    "Block access type is not supported",
                ));
            }
            None => "",
        };

        mount::validate_fs_type(fs_type).map_err(|e| Status::invalid_argument(e.to_string()))
    }

    /// Stage the published device at the staging path.
    fn stage_volume(&self, req: &csi::NodeStageVolumeRequest) -> Result<(), Status> {
        let volume_id = &req.volume_id;
        let staging_target_path = &req.staging_target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path("Staging target path", staging_target_path)?;

        let device = req
            .publish_context
            .get(PUBLISH_CONTEXT_DEVICE_KEY)
            .map(String::as_str)
            .unwrap_or("");
        if device.is_empty() {
            return Err(Status::invalid_argument(
                "Publish context is missing the device path",
            ));
        }
        Self::validate_path("Device path", device)?;

        let fs_type = Self::requested_fs_type(req.volume_capability.as_ref())?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            device = %device,
            fs_type = %fs_type,
            "NodeStageVolume request"
        );

        // No-op when the device already carries a filesystem
        self.mounter.format(device, fs_type).map_err(|e| {
            error!(device = %device, error = %e, "Failed to format device");
            Status::internal(format!("failed to format {}: {}", device, e))
        })?;

        self.mounter
            .mkdir_all(staging_target_path, MOUNT_DIR_MODE)
            .map_err(|e| {
                error!(path = %staging_target_path, error = %e, "Failed to create staging path");
                Status::internal(format!(
                    "failed to create staging path {}: {}",
                    staging_target_path, e
                ))
            })?;

        self.mounter
            .mount(device, staging_target_path, fs_type)
            .map_err(|e| {
                error!(
                    device = %device,
                    staging_target_path = %staging_target_path,
                    error = %e,
                    "Failed to mount device"
                );
                Status::internal(format!(
                    "failed to mount {} on {}: {}",
                    device, staging_target_path, e
                ))
            })?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            device = %device,
            "Volume staged successfully"
        );

        Ok(())
    }

    fn unstage_volume(&self, req: &csi::NodeUnstageVolumeRequest) -> Result<(), Status> {
        let volume_id = &req.volume_id;
        let staging_target_path = &req.staging_target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path("Staging target path", staging_target_path)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "NodeUnstageVolume request"
        );

        self.mounter.unmount(staging_target_path).map_err(|e| {
            error!(staging_target_path = %staging_target_path, error = %e, "Failed to unmount");
            Status::internal(format!("failed to unmount {}: {}", staging_target_path, e))
        })?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "Volume unstaged successfully"
        );

        Ok(())
    }

    /// Bind-mount the staging path onto the target path.
    fn publish_volume(&self, req: &csi::NodePublishVolumeRequest) -> Result<(), Status> {
        let volume_id = &req.volume_id;
        let target_path = &req.target_path;
        let staging_target_path = &req.staging_target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path("Staging target path", staging_target_path)?;
        Self::validate_path("Target path", target_path)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            target_path = %target_path,
            readonly = req.readonly,
            "NodePublishVolume request"
        );

        self.mounter
            .mkdir_all(target_path, MOUNT_DIR_MODE)
            .map_err(|e| {
                error!(path = %target_path, error = %e, "Failed to create target path");
                Status::internal(format!(
                    "failed to create target path {}: {}",
                    target_path, e
                ))
            })?;

        self.mounter
            .bind_mount(staging_target_path, target_path)
            .map_err(|e| {
                error!(
                    staging_target_path = %staging_target_path,
                    target_path = %target_path,
                    error = %e,
                    "Failed to bind mount"
                );
                Status::internal(format!(
                    "failed to bind mount {} on {}: {}",
                    staging_target_path, target_path, e
                ))
            })?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "Volume published successfully"
        );

        Ok(())
    }

    fn unpublish_volume(&self, req: &csi::NodeUnpublishVolumeRequest) -> Result<(), Status> {
        let volume_id = &req.volume_id;
        let target_path = &req.target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path("Target path", target_path)?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "NodeUnpublishVolume request"
        );

        self.mounter.unmount(target_path).map_err(|e| {
            error!(target_path = %target_path, error = %e, "Failed to unmount");
            Status::internal(format!("failed to unmount {}: {}", target_path, e))
        })?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "Volume unpublished successfully"
        );

        Ok(())
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume to a staging path.
    /// Formats the published device if it carries no filesystem, then mounts it.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        let result = self.stage_volume(&request.into_inner());

        timer.observe(result.map(|()| Response::new(csi::NodeStageVolumeResponse {})))
    }

    /// Unstage a volume from the staging path.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        let result = self.unstage_volume(&request.into_inner());

        timer.observe(result.map(|()| Response::new(csi::NodeUnstageVolumeResponse {})))
    }

    /// Publish a volume to a target path (bind mount from staging).
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let result = self.publish_volume(&request.into_inner());

        timer.observe(result.map(|()| Response::new(csi::NodePublishVolumeResponse {})))
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let result = self.unpublish_volume(&request.into_inner());

        timer.observe(result.map(|()| Response::new(csi::NodeUnpublishVolumeResponse {})))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc {
                    r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                },
            )),
        }];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    /// Get volume statistics (not implemented).
    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}

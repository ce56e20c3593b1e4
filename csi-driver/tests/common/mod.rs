//! In-memory stand-ins for the host and the control plane.

#![allow(dead_code)] // Each test binary uses a different subset

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use cloudblock_csi::cloud::{self, ControlPlane, ControlPlaneError, CreatedVolume};
use cloudblock_csi::mount::{self, MountError, Mounter};

// ============================================================================
// FakeMounter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Format { device: String, fs_type: String },
    Mount { source: String, target: String, fs_type: String },
    BindMount { source: String, target: String },
    Unmount { target: String },
    MkdirAll { path: String, mode: u32 },
}

#[derive(Default)]
struct MounterState {
    calls: Vec<MountCall>,
    formatted: HashSet<String>,
    mounted: HashSet<String>,
    filesystems_created: usize,
    failures: HashMap<&'static str, String>,
}

/// Records every Mounter call and tracks formatted devices and mount points.
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<MounterState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call to `operation` fail with `message`.
    pub fn fail(&self, operation: &'static str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(operation, message.to_string());
    }

    pub fn mark_formatted(&self, device: &str) {
        self.state.lock().unwrap().formatted.insert(device.to_string());
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Number of times a filesystem was actually written to a device.
    pub fn filesystems_created(&self) -> usize {
        self.state.lock().unwrap().filesystems_created
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.state.lock().unwrap().mounted.contains(target)
    }

    fn check(state: &MounterState, operation: &'static str) -> mount::Result<()> {
        match state.failures.get(operation) {
            Some(message) => Err(MountError::CommandFailed {
                command: operation.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Mounter for FakeMounter {
    fn is_formatted(&self, device: &str) -> mount::Result<bool> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "is_formatted")?;
        Ok(state.formatted.contains(device))
    }

    fn format(&self, device: &str, fs_type: &str) -> mount::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MountCall::Format {
            device: device.to_string(),
            fs_type: fs_type.to_string(),
        });
        Self::check(&state, "format")?;

        if state.formatted.insert(device.to_string()) {
            state.filesystems_created += 1;
        }
        Ok(())
    }

    fn mount(&self, source: &str, target: &str, fs_type: &str) -> mount::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MountCall::Mount {
            source: source.to_string(),
            target: target.to_string(),
            fs_type: fs_type.to_string(),
        });
        Self::check(&state, "mount")?;
        state.mounted.insert(target.to_string());
        Ok(())
    }

    fn bind_mount(&self, source: &str, target: &str) -> mount::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MountCall::BindMount {
            source: source.to_string(),
            target: target.to_string(),
        });
        Self::check(&state, "bind_mount")?;
        state.mounted.insert(target.to_string());
        Ok(())
    }

    fn unmount(&self, target: &str) -> mount::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MountCall::Unmount {
            target: target.to_string(),
        });
        Self::check(&state, "unmount")?;
        state.mounted.remove(target);
        Ok(())
    }

    fn mkdir_all(&self, path: &str, mode: u32) -> mount::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MountCall::MkdirAll {
            path: path.to_string(),
            mode,
        });
        Self::check(&state, "mkdir_all")
    }
}

// ============================================================================
// FakeControlPlane
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    CreateVolume { name: String, size_gb: i64 },
    DeleteVolume { volume_id: String },
    GetInstance { node: String },
    AttachVolume { volume_id: String, instance_id: String, device: String },
    DetachVolume { volume_id: String },
}

/// Failure to inject; `ControlPlaneError` itself is not `Clone`.
#[derive(Debug, Clone)]
pub enum Failure {
    NotFound(String),
    Api(u16, String),
}

impl Failure {
    fn to_error(&self) -> ControlPlaneError {
        match self {
            Failure::NotFound(message) => ControlPlaneError::NotFound(message.clone()),
            Failure::Api(status, message) => ControlPlaneError::Api {
                status: *status,
                message: message.clone(),
            },
        }
    }
}

#[derive(Default)]
struct CloudState {
    calls: Vec<CloudCall>,
    created: Option<CreatedVolume>,
    instances: HashMap<String, String>,
    failures: HashMap<&'static str, Failure>,
}

/// Records every control-plane call and returns programmed results.
///
/// Without programming, `create_volume` returns `vol-<name>` with the
/// requested size and `get_instance` fails with NotFound.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<CloudState>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, node: &str, instance_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(node.to_string(), instance_id.to_string());
        self
    }

    /// Return this volume from every later `create_volume`.
    pub fn set_created_volume(&self, volume_id: &str, size_gb: i64) {
        self.state.lock().unwrap().created = Some(CreatedVolume {
            volume_id: volume_id.to_string(),
            size_gb,
        });
    }

    pub fn fail(&self, operation: &'static str, failure: Failure) {
        self.state.lock().unwrap().failures.insert(operation, failure);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, operation: &'static str, call: CloudCall) -> cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.get(operation) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

#[tonic::async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_volume(&self, name: &str, size_gb: i64) -> cloud::Result<CreatedVolume> {
        self.record(
            "create_volume",
            CloudCall::CreateVolume {
                name: name.to_string(),
                size_gb,
            },
        )?;

        let state = self.state.lock().unwrap();
        Ok(state.created.clone().unwrap_or_else(|| CreatedVolume {
            volume_id: format!("vol-{}", name),
            size_gb,
        }))
    }

    async fn delete_volume(&self, volume_id: &str) -> cloud::Result<()> {
        self.record(
            "delete_volume",
            CloudCall::DeleteVolume {
                volume_id: volume_id.to_string(),
            },
        )
    }

    async fn get_instance(&self, node: &str) -> cloud::Result<String> {
        self.record(
            "get_instance",
            CloudCall::GetInstance {
                node: node.to_string(),
            },
        )?;

        let state = self.state.lock().unwrap();
        state
            .instances
            .get(node)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("instance {}", node)))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> cloud::Result<()> {
        self.record(
            "attach_volume",
            CloudCall::AttachVolume {
                volume_id: volume_id.to_string(),
                instance_id: instance_id.to_string(),
                device: device.to_string(),
            },
        )
    }

    async fn detach_volume(&self, volume_id: &str) -> cloud::Result<()> {
        self.record(
            "detach_volume",
            CloudCall::DetachVolume {
                volume_id: volume_id.to_string(),
            },
        )
    }
}

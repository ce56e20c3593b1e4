//! Host filesystem operations for the CSI Node service
//!
//! The [`Mounter`] trait is the only boundary between the driver and the
//! kernel: formatting block devices, mounting, bind-mounting, unmounting and
//! creating mount-point directories. [`linux::LinuxMounter`] implements it
//! by shelling out to the usual util-linux / e2fsprogs tools; tests swap in
//! an in-memory fake.
//!
//! # Usage
//!
//! ```ignore
//! use crate::mount::{Mounter, linux::LinuxMounter};
//!
//! let mounter = LinuxMounter::new();
//! mounter.format("/dev/vdb", "ext4")?;
//! mounter.mkdir_all("/var/lib/kubelet/staging/vol-1", 0o750)?;
//! mounter.mount("/dev/vdb", "/var/lib/kubelet/staging/vol-1", "ext4")?;
//! ```

pub mod linux;

use thiserror::Error;

/// Filesystem used when the volume capability does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

#[derive(Error, Debug)]
pub enum MountError {
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("{target} is already mounted from {existing}, not {requested}")]
    MountedElsewhere {
        target: String,
        existing: String,
        requested: String,
    },

    #[error("unsupported filesystem type '{0}': supported types are ext4, xfs")]
    UnsupportedFilesystem(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MountError>;

/// Capability interface over host mount operations.
///
/// Implementations must be idempotent where the CSI node RPCs rely on it:
/// `format` is a no-op on a device that already carries a filesystem and
/// `unmount` succeeds on a path that is not mounted.
pub trait Mounter: Send + Sync {
    /// Returns true when the device carries a recognizable filesystem signature.
    fn is_formatted(&self, device: &str) -> Result<bool>;

    /// Create a filesystem of `fs_type` on `device` unless one is already present.
    fn format(&self, device: &str, fs_type: &str) -> Result<()>;

    /// Mount `source` on `target` as `fs_type`.
    fn mount(&self, source: &str, target: &str, fs_type: &str) -> Result<()>;

    /// Share the mount at `source` on `target`.
    fn bind_mount(&self, source: &str, target: &str) -> Result<()>;

    /// Unmount `target`; "not currently mounted" counts as success.
    fn unmount(&self, target: &str) -> Result<()>;

    /// Create `path` and any missing parents with permission bits `mode`.
    fn mkdir_all(&self, path: &str, mode: u32) -> Result<()>;
}

/// Normalize a requested filesystem type to one this driver can create.
///
/// An empty string selects [`DEFAULT_FS_TYPE`].
pub fn validate_fs_type(fs_type: &str) -> Result<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "ext4" | "" => Ok(DEFAULT_FS_TYPE),
        "xfs" => Ok("xfs"),
        _ => Err(MountError::UnsupportedFilesystem(fs_type.to_string())),
    }
}

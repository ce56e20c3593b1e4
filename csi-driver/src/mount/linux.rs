//! Linux implementation of [`Mounter`]
//!
//! Uses the standard host tools:
//! - blkid for filesystem detection
//! - mkfs.ext4/mkfs.xfs for formatting
//! - mount/umount for regular and bind mounts
//!
//! Mount state is read from /proc/mounts. External commands run to
//! completion; they are not interrupted when the calling RPC is cancelled.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::process::{Command, Output};

use tracing::{debug, error, info, warn};

use super::{MountError, Mounter, Result, validate_fs_type};

const PROC_MOUNTS: &str = "/proc/mounts";

/// blkid exit status when no signature was found on the device.
const BLKID_NOTHING_FOUND: i32 = 2;

/// Mounter backed by the host's filesystem utilities.
#[derive(Debug, Clone, Default)]
pub struct LinuxMounter;

impl LinuxMounter {
    pub fn new() -> Self {
        Self
    }

    /// Check if a path is currently a mount point.
    pub fn is_mounted(&self, target: &str) -> Result<bool> {
        let mounts = fs::read_to_string(PROC_MOUNTS)?;
        Ok(mount_table_contains(&mounts, target))
    }

    /// Device backing the mount on `target`, if any.
    pub fn mounted_source(&self, target: &str) -> Result<Option<String>> {
        let mounts = fs::read_to_string(PROC_MOUNTS)?;
        Ok(mount_source(&mounts, target))
    }
}

/// Run a command to completion, capturing its output.
fn run(program: &str, args: &[&str]) -> Result<Output> {
    debug!(program = %program, args = ?args, "Executing command");

    Command::new(program).args(args).output().map_err(|e| {
        error!(error = %e, program = %program, "Failed to execute command");
        MountError::CommandFailed {
            command: program.to_string(),
            message: format!("failed to execute: {}", e),
        }
    })
}

/// Run a command and turn a non-zero exit into [`MountError::CommandFailed`].
fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let output = run(program, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(program = %program, stderr = %stderr, "Command failed");
        return Err(MountError::CommandFailed {
            command: program.to_string(),
            message: stderr.trim().to_string(),
        });
    }
    Ok(())
}

/// Whether `blkid -p` output describes a filesystem or partition table.
///
/// A partition table is treated as "formatted" so an existing layout is
/// never overwritten.
fn has_signature(blkid_stdout: &str) -> bool {
    blkid_stdout.contains("TYPE=")
}

/// Decode the octal escapes (`\040` for space, etc.) used in /proc/mounts.
fn unescape_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(value) = u8::from_str_radix(&field[i + 1..i + 4], 8)
        {
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn normalize_mount_point(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Source of the topmost mount on `target` in a /proc/mounts dump.
///
/// Later lines shadow earlier ones when the same path is mounted twice.
fn mount_source(mounts: &str, target: &str) -> Option<String> {
    let target = normalize_mount_point(target);
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = unescape_mount_path(fields.next()?);
            (mount_point == target).then(|| unescape_mount_path(source))
        })
        .last()
}

/// Whether `target` appears as a mount point in a /proc/mounts dump.
fn mount_table_contains(mounts: &str, target: &str) -> bool {
    mount_source(mounts, target).is_some()
}

/// Compare device paths after resolving symlinks such as /dev/disk/by-id.
fn same_device(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Decide whether an existing mount on `target` already satisfies a request
/// to mount `wanted` there.
///
/// `Ok(false)` means nothing is mounted yet.
fn check_existing_mount(existing: Option<&str>, wanted: &str, target: &str) -> Result<bool> {
    match existing {
        None => Ok(false),
        Some(existing) if same_device(existing, wanted) => Ok(true),
        Some(existing) => {
            warn!(
                target = %target,
                existing = %existing,
                requested = %wanted,
                "Target is mounted from a different source"
            );
            Err(MountError::MountedElsewhere {
                target: target.to_string(),
                existing: existing.to_string(),
                requested: wanted.to_string(),
            })
        }
    }
}

impl Mounter for LinuxMounter {
    fn is_formatted(&self, device: &str) -> Result<bool> {
        let output = run("blkid", &["-p", device])?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(has_signature(&stdout));
        }

        if output.status.code() == Some(BLKID_NOTHING_FOUND) {
            return Ok(false);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(device = %device, stderr = %stderr, "blkid failed");
        Err(MountError::CommandFailed {
            command: "blkid".to_string(),
            message: stderr.trim().to_string(),
        })
    }

    fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let fs_type = validate_fs_type(fs_type)?;

        if self.is_formatted(device)? {
            debug!(device = %device, "Device already carries a filesystem, skipping format");
            return Ok(());
        }

        info!(device = %device, fs_type = %fs_type, "Formatting device");

        match fs_type {
            // -F/-f: don't prompt
            "xfs" => run_checked("mkfs.xfs", &["-f", device]),
            _ => run_checked("mkfs.ext4", &["-F", device]),
        }
    }

    fn mount(&self, source: &str, target: &str, fs_type: &str) -> Result<()> {
        let existing = self.mounted_source(target)?;
        if check_existing_mount(existing.as_deref(), source, target)? {
            debug!(target = %target, "Target already mounted, skipping mount");
            return Ok(());
        }

        info!(source = %source, target = %target, fs_type = %fs_type, "Mounting device");
        run_checked("mount", &["-t", &fs_type.to_lowercase(), source, target])
    }

    fn bind_mount(&self, source: &str, target: &str) -> Result<()> {
        let mounts = fs::read_to_string(PROC_MOUNTS)?;
        // A bind mount is listed with the device of the mount it shares
        let wanted = mount_source(&mounts, source).unwrap_or_else(|| source.to_string());
        let existing = mount_source(&mounts, target);
        if check_existing_mount(existing.as_deref(), &wanted, target)? {
            debug!(target = %target, "Target already mounted, skipping bind mount");
            return Ok(());
        }

        info!(source = %source, target = %target, "Creating bind mount");
        run_checked("mount", &["--bind", source, target])
    }

    fn unmount(&self, target: &str) -> Result<()> {
        if !self.is_mounted(target)? {
            debug!(target = %target, "Path is not mounted, skipping unmount");
            return Ok(());
        }

        info!(target = %target, "Unmounting");

        let output = run("umount", &[target])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Lost a race with another unmount
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target, "Path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(MountError::CommandFailed {
                command: "umount".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        debug!(path = %path, mode = %format!("{:o}", mode), "Creating directory");
        DirBuilder::new().recursive(true).mode(mode).create(path)?;
        Ok(())
    }
}

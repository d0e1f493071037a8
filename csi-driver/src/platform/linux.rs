//! Linux filesystem and mount helpers for CSI Node operations
//!
//! These run inside the node container, whose mount namespace is the one
//! kubelet sees. Only session management goes through the relay.
//!
//! Uses:
//! - mkfs.ext4/mkfs.xfs for filesystem formatting
//! - blkid for filesystem detection
//! - mount/umount, including `--bind` and `remount,ro`

use std::fs;
use std::path::Path;
use std::process::Command;

use tonic::Status;
use tracing::{debug, error, info, warn};

use super::PlatformResult;

/// Default filesystem type for Linux
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Run a local tool, mapping spawn errors and non-zero exits to `Status`.
fn run(program: &str, args: &[&str]) -> PlatformResult<String> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        error!(error = %e, program, "Failed to execute command");
        Status::internal(format!("Failed to execute {}: {}", program, e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, program, args = ?args, "Command failed");
        return Err(Status::internal(format!(
            "{} failed: {}",
            program,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Format a device with the specified filesystem type.
pub fn format_device(device: &str, fs_type: &str) -> PlatformResult<()> {
    info!(device = %device, fs_type = %fs_type, "Formatting device");

    match validate_fs_type(fs_type)? {
        // -F / -f to force (don't prompt)
        "ext4" => run("mkfs.ext4", &["-F", device])?,
        "xfs" => run("mkfs.xfs", &["-f", device])?,
        other => {
            return Err(Status::invalid_argument(format!(
                "Unsupported filesystem type on Linux: {}",
                other
            )));
        }
    };

    Ok(())
}

/// `blkid` exit status for "nothing identified on the device".
const BLKID_EXIT_NOTFOUND: i32 = 2;

/// Check if a device needs formatting (has no valid filesystem).
pub fn needs_formatting(device: &str) -> PlatformResult<bool> {
    let output = Command::new("blkid")
        .args(["-p", device])
        .output()
        .map_err(|e| {
            error!(error = %e, "Failed to execute blkid");
            Status::internal(format!("Failed to check device filesystem: {}", e))
        })?;

    blkid_needs_formatting(
        device,
        output.status.code(),
        &String::from_utf8_lossy(&output.stdout),
        &String::from_utf8_lossy(&output.stderr),
    )
}

/// Interpret a `blkid -p` result. Only "nothing found" allows formatting;
/// ambiguous probes and I/O errors must never lead to mkfs.
fn blkid_needs_formatting(
    device: &str,
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> PlatformResult<bool> {
    match code {
        Some(0) => Ok(!stdout.contains("TYPE=")),
        Some(BLKID_EXIT_NOTFOUND) => Ok(true),
        other => {
            error!(device = %device, status = ?other, stderr = %stderr.trim(), "blkid probe failed");
            Err(Status::internal(format!(
                "Cannot determine filesystem on {} (blkid status {:?}): {}",
                device,
                other,
                stderr.trim()
            )))
        }
    }
}

/// Mount a device to a target directory.
pub fn mount_device(
    device: &str,
    target: &str,
    fs_type: &str,
    flags: &[String],
) -> PlatformResult<()> {
    info!(device = %device, target = %target, fs_type = %fs_type, flags = ?flags, "Mounting device");

    fs::create_dir_all(target).map_err(|e| {
        error!(error = %e, "Failed to create mount target directory");
        Status::internal(format!("Failed to create mount directory: {}", e))
    })?;

    let options = flags.join(",");
    let mut args = vec!["-t", fs_type];
    if !options.is_empty() {
        args.extend(["-o", options.as_str()]);
    }
    args.extend([device, target]);

    run("mount", &args)?;
    Ok(())
}

/// Bind mount a staged directory onto a publish directory.
pub fn bind_mount(source: &str, target: &str) -> PlatformResult<()> {
    info!(source = %source, target = %target, "Creating bind mount");

    fs::create_dir_all(target).map_err(|e| {
        error!(error = %e, "Failed to create bind mount target directory");
        Status::internal(format!(
            "Failed to create bind mount target directory: {}",
            e
        ))
    })?;

    run("mount", &["--bind", source, target])?;
    Ok(())
}

/// Bind mount a block device onto a publish file.
pub fn bind_mount_device(device: &str, target: &str) -> PlatformResult<()> {
    info!(device = %device, target = %target, "Bind mounting block device");

    let target_path = Path::new(target);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Status::internal(format!("Failed to create parent of {}: {}", target, e))
        })?;
    }
    if !target_path.exists() {
        fs::File::create(target_path).map_err(|e| {
            Status::internal(format!("Failed to create block target {}: {}", target, e))
        })?;
    }

    run("mount", &["--bind", device, target])?;
    Ok(())
}

/// Remount a bind mount read-only.
pub fn remount_readonly(target: &str) -> PlatformResult<()> {
    run("mount", &["-o", "remount,bind,ro", target])?;
    Ok(())
}

/// Unmount a path.
pub fn unmount(target: &str) -> PlatformResult<()> {
    info!(target = %target, "Unmounting");

    if !is_mounted(target)? {
        debug!(target = %target, "Path is not mounted, skipping unmount");
        return Ok(());
    }

    let output = Command::new("umount").arg(target).output().map_err(|e| {
        error!(error = %e, "Failed to execute umount");
        Status::internal(format!("Failed to execute umount: {}", e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Treat "not mounted" as success
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            warn!(target = %target, "Path was not mounted");
            return Ok(());
        }
        error!(stderr = %stderr, "umount failed");
        return Err(Status::internal(format!("umount failed: {}", stderr)));
    }

    Ok(())
}

/// Whether `target` appears as a mount point in a `/proc/mounts` listing.
fn mounts_contain(mounts: &str, target: &str) -> bool {
    mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(target))
}

/// Check if a path is currently mounted.
pub fn is_mounted(target: &str) -> PlatformResult<bool> {
    let mounts = fs::read_to_string("/proc/mounts").map_err(|e| {
        error!(error = %e, "Failed to read /proc/mounts");
        Status::internal(format!("Failed to check mounts: {}", e))
    })?;
    Ok(mounts_contain(&mounts, target))
}

/// Validate filesystem type for Linux.
pub fn validate_fs_type(fs_type: &str) -> PlatformResult<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "" => Ok(DEFAULT_FS_TYPE),
        "ext4" => Ok("ext4"),
        "xfs" => Ok("xfs"),
        _ => Err(Status::invalid_argument(format!(
            "Unsupported filesystem on Linux: {}. Supported: ext4, xfs",
            fs_type
        ))),
    }
}

//! Platform operations for CSI Node service
//!
//! Filesystem formatting, mounts and bind mounts. iSCSI session handling is
//! not here: it runs on the host through the relay (see [`crate::attach`]).

mod linux;

use tonic::Status;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, Status>;

pub use linux::{
    DEFAULT_FS_TYPE, bind_mount, bind_mount_device, format_device, is_mounted, mount_device,
    needs_formatting, remount_readonly, unmount, validate_fs_type,
};

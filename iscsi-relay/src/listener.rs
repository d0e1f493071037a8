//! Unix socket endpoint handling.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::error::{RelayError, Result};

/// Resolve a `unix://` endpoint to a filesystem path.
///
/// Accepts `unix:///abs/path`, `unix://rel/path` (host joined with path) and
/// a bare absolute path.
pub fn socket_path(endpoint: &str) -> Result<PathBuf> {
    let path = match endpoint.strip_prefix("unix://") {
        Some(rest) => rest,
        None if endpoint.starts_with('/') => endpoint,
        None => return Err(RelayError::InvalidEndpoint(endpoint.to_string())),
    };

    if path.is_empty() || path.ends_with('/') {
        return Err(RelayError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok(PathBuf::from(path))
}

/// Bind a fresh listener at `path`.
///
/// A stale socket left by a previous instance is removed and missing parent
/// directories are created. The socket file mode is set to `mode`; file
/// permissions are the only access control on the relay.
pub fn bind(path: &Path, mode: u32) -> Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

    debug!(path = %path.display(), mode = %format!("{:o}", mode), "Socket bound");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_forms() {
        assert_eq!(
            socket_path("unix:///iscsi-socket/iscsi.sock").unwrap(),
            PathBuf::from("/iscsi-socket/iscsi.sock")
        );
        assert_eq!(
            socket_path("unix://run/iscsi.sock").unwrap(),
            PathBuf::from("run/iscsi.sock")
        );
        assert_eq!(
            socket_path("/var/run/iscsi.sock").unwrap(),
            PathBuf::from("/var/run/iscsi.sock")
        );
    }

    #[test]
    fn test_socket_path_invalid() {
        assert!(socket_path("tcp://127.0.0.1:50051").is_err());
        assert!(socket_path("relative.sock").is_err());
        assert!(socket_path("unix://").is_err());
        assert!(socket_path("unix:///run/").is_err());
    }

    #[tokio::test]
    async fn test_bind_creates_parents_and_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/iscsi.sock");

        let first = bind(&path, 0o600).unwrap();
        drop(first);
        assert!(path.exists(), "socket file outlives the listener");

        // Second bind must clear the stale file instead of failing with EADDRINUSE
        let _second = bind(&path, 0o660).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o660);
    }
}

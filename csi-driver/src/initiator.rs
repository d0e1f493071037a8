//! One-time initiator identity bootstrap.
//!
//! open-iscsi inside the node container needs `/etc/iscsi/initiatorname.iscsi`
//! to match the host's identity. The file is written once from the relay's
//! answer and never rewritten afterwards.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RelayError;
use crate::relay_client::CommandRelay;

/// Default location of the initiator configuration inside the container.
pub const DEFAULT_INITIATOR_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// Deadline for the identity query.
const IDENTITY_DEADLINE: Duration = Duration::from_secs(5);

/// Process-scoped handle on the initiator file.
///
/// The mutex only keeps concurrent callers in this process from all querying
/// the relay; the file is published with a no-clobber link of a fully
/// written temporary, so an existing file is never replaced even when
/// another process wins the race.
#[derive(Debug)]
pub struct InitiatorFile {
    path: PathBuf,
    guard: Mutex<()>,
}

impl InitiatorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make sure the initiator file exists.
    ///
    /// Returns `true` when this call wrote it, `false` when it was already
    /// present.
    pub async fn ensure(&self, relay: &dyn CommandRelay) -> Result<bool, RelayError> {
        let _held = self.guard.lock().await;

        if tokio::fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "Initiator file present");
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let name = relay.initiator_name(IDENTITY_DEADLINE).await?;
        let name = name.trim();
        if name.is_empty() || name.contains('\n') {
            return Err(RelayError::Relay(tonic::Status::failed_precondition(
                "relay returned an unusable initiator name",
            )));
        }

        let path = self.path.clone();
        let line = format!("InitiatorName={}\n", name);
        let written = tokio::task::spawn_blocking(move || write_new(&path, &line))
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;

        if written {
            info!(path = %self.path.display(), initiator = %name, "Wrote initiator file");
        } else {
            debug!(path = %self.path.display(), "Initiator file created concurrently");
        }
        Ok(written)
    }
}

impl Default for InitiatorFile {
    fn default() -> Self {
        Self::new(DEFAULT_INITIATOR_FILE)
    }
}

/// Create `path` with `contents`; `Ok(false)` if it already exists.
fn write_new(path: &Path, contents: &str) -> std::io::Result<bool> {
    publish_new(path, |file| file.write_all(contents.as_bytes()))
}

/// Fill a temporary file next to `path`, then link it into place without
/// replacing anything already there.
///
/// `path` only ever appears complete. The temporary is removed on every
/// path out, including a failed `fill`.
fn publish_new(
    path: &Path,
    fill: impl FnOnce(&mut std::fs::File) -> std::io::Result<()>,
) -> std::io::Result<bool> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".initiatorname.")
        .tempfile_in(dir)?;
    fill(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;

    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

//! Host initiator name lookup.
//!
//! open-iscsi keeps the host's initiator IQN in a small key/value file:
//!
//! ```text
//! ## DO NOT EDIT OR REMOVE THIS FILE!
//! InitiatorName=iqn.1993-08.org.debian:01:abcdef
//! ```

use std::path::Path;

use tracing::debug;

use crate::error::{RelayError, Result};

/// Default location of the open-iscsi initiator configuration.
pub const DEFAULT_INITIATOR_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

const INITIATOR_KEY: &str = "InitiatorName=";

/// Extract the value of the first `InitiatorName=` line, ignoring comments.
pub fn parse_initiator_name(contents: &str) -> Option<&str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix(INITIATOR_KEY))
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

/// Read the initiator name configured on this host.
pub async fn read_initiator_name(path: &Path) -> Result<String> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RelayError::InitiatorNotConfigured(
                path.display().to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let name = parse_initiator_name(&contents)
        .ok_or_else(|| RelayError::InitiatorNotConfigured(path.display().to_string()))?;

    debug!(path = %path.display(), initiator = %name, "Read initiator name");
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_initiator_name() {
        assert_eq!(
            parse_initiator_name("InitiatorName=iqn.1993-08.org.debian:01:abc\n"),
            Some("iqn.1993-08.org.debian:01:abc")
        );
        assert_eq!(
            parse_initiator_name(
                "## DO NOT EDIT\n#InitiatorName=iqn.old\n  InitiatorName=iqn.new  \n"
            ),
            Some("iqn.new")
        );
    }

    #[test]
    fn test_parse_initiator_name_missing() {
        assert_eq!(parse_initiator_name(""), None);
        assert_eq!(parse_initiator_name("InitiatorAlias=node1\n"), None);
        assert_eq!(parse_initiator_name("InitiatorName=\n"), None);
    }

    #[tokio::test]
    async fn test_read_initiator_name_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("initiatorname.iscsi");
        std::fs::write(&path, "InitiatorName=iqn.2004-10.com.example:host1\n").unwrap();

        let name = read_initiator_name(&path).await.unwrap();
        assert_eq!(name, "iqn.2004-10.com.example:host1");
    }

    #[tokio::test]
    async fn test_read_initiator_name_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(matches!(
            read_initiator_name(&missing).await,
            Err(RelayError::InitiatorNotConfigured(_))
        ));

        let empty = dir.path().join("empty");
        std::fs::write(&empty, "# nothing here\n").unwrap();
        assert!(matches!(
            read_initiator_name(&empty).await,
            Err(RelayError::InitiatorNotConfigured(_))
        ));
    }
}

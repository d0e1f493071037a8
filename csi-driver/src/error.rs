use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tonic::Status;

use crate::types::{InvalidDescriptor, Portal};

/// Failures crossing the privilege boundary.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to connect to relay at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("invalid relay address '{0}': expected unix:///path/to/socket")]
    InvalidAddress(String),

    /// The relay answered with an error, including command execution faults
    #[error("relay call failed: {}", .0.message())]
    Relay(#[from] Status),

    /// The deadline passed; the command may or may not have taken effect
    #[error("relay call exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// True when the remote outcome is unknown and must be re-derived.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Timeout(_))
    }
}

/// A per-portal failure collected during login or logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalFailure {
    pub portal: Portal,
    pub reason: String,
}

impl fmt::Display for PortalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.portal, self.reason)
    }
}

fn join_failures(failures: &[PortalFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Attach and detach failures.
///
/// None of these are fatal to the process; every variant goes back to the
/// caller, which decides whether to retry the whole operation.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error(transparent)]
    InvalidDescriptor(#[from] InvalidDescriptor),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(
        "logged in to {succeeded} of {required} required portals for {target}: {}",
        join_failures(.failures)
    )]
    PartialLogin {
        target: String,
        succeeded: usize,
        required: usize,
        failures: Vec<PortalFailure>,
    },

    #[error("no block device for {target} after {polls} polls")]
    DeviceNotFound { target: String, polls: u32 },

    #[error("logout failed for every session of {target}: {}", join_failures(.failures))]
    AggregateDetach {
        target: String,
        failures: Vec<PortalFailure>,
    },
}

pub type Result<T> = std::result::Result<T, AttachError>;

impl AttachError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AttachError::InvalidDescriptor(_) => "invalid_descriptor",
            AttachError::Relay(RelayError::Timeout(_)) => "timeout",
            AttachError::Relay(_) => "relay_failure",
            AttachError::PartialLogin { .. } => "partial_login",
            AttachError::DeviceNotFound { .. } => "device_not_found",
            AttachError::AggregateDetach { .. } => "aggregate_detach",
        }
    }
}

impl From<AttachError> for Status {
    fn from(err: AttachError) -> Self {
        let message = err.to_string();
        match err {
            AttachError::InvalidDescriptor(_) => Status::invalid_argument(message),
            AttachError::Relay(RelayError::Timeout(_)) => Status::deadline_exceeded(message),
            AttachError::Relay(RelayError::InvalidAddress(_)) => Status::internal(message),
            AttachError::Relay(_) => Status::unavailable(message),
            AttachError::PartialLogin { .. } => Status::resource_exhausted(message),
            AttachError::DeviceNotFound { .. } => Status::not_found(message),
            AttachError::AggregateDetach { .. } => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let invalid: Status = AttachError::from(InvalidDescriptor("no portals".into())).into();
        assert_eq!(invalid.code(), tonic::Code::InvalidArgument);

        let timeout: Status =
            AttachError::from(RelayError::Timeout(Duration::from_secs(5))).into();
        assert_eq!(timeout.code(), tonic::Code::DeadlineExceeded);

        let partial: Status = AttachError::PartialLogin {
            target: "iqn.x".into(),
            succeeded: 1,
            required: 2,
            failures: vec![],
        }
        .into();
        assert_eq!(partial.code(), tonic::Code::ResourceExhausted);

        let missing: Status = AttachError::DeviceNotFound {
            target: "iqn.x".into(),
            polls: 12,
        }
        .into();
        assert_eq!(missing.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_failure_messages_name_portals() {
        let err = AttachError::AggregateDetach {
            target: "iqn.2013-01.com.example:test".into(),
            failures: vec![
                PortalFailure {
                    portal: Portal::new("10.0.0.1", 3260),
                    reason: "timed out".into(),
                },
                PortalFailure {
                    portal: Portal::new("10.0.0.2", 3260),
                    reason: "refused".into(),
                },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("10.0.0.1:3260: timed out"));
        assert!(message.contains("10.0.0.2:3260: refused"));
        assert_eq!(err.kind(), "aggregate_detach");
    }
}

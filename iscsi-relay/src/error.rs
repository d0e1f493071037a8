use std::process::ExitStatus;

use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("argument vector is empty")]
    EmptyCommand,

    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' failed ({status}): {output}")]
    CommandFailed {
        program: String,
        status: ExitStatus,
        output: String,
    },

    #[error("initiator name not configured in {0}")]
    InitiatorNotConfigured(String),

    #[error("invalid endpoint '{0}': expected unix:///path/to/socket")]
    InvalidEndpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<RelayError> for Status {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::EmptyCommand | RelayError::InvalidEndpoint(_) => {
                Status::invalid_argument(err.to_string())
            }
            RelayError::InitiatorNotConfigured(_) => Status::failed_precondition(err.to_string()),
            // Execution faults stay Unknown; the message carries the tool's
            // own report so callers can classify benign conditions.
            RelayError::Spawn { .. } | RelayError::CommandFailed { .. } => {
                Status::unknown(err.to_string())
            }
            RelayError::Io(_) => Status::internal(err.to_string()),
        }
    }
}

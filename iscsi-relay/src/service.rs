//! gRPC relay service implementation.
//!
//! Every RPC is synchronous from the caller's point of view: it returns when
//! the host command exits. Calls for different targets are not serialized;
//! the admin tool itself arbitrates races on the same target.

use std::path::PathBuf;

use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use crate::error::RelayError;
use crate::exec;
use crate::initiator;
use crate::metrics::{self, CommandTimer};

/// Generated protobuf types and service trait
pub mod proto {
    tonic::include_proto!("iscsi_relay.v1");
}

use proto::iscsi_relay_server::IscsiRelay;
use proto::{
    ExecuteCommandRequest, ExecuteCommandResponse, GetInitiatorNameRequest,
    GetInitiatorNameResponse,
};

/// Relay service executing host commands for the node plugin.
#[derive(Debug, Clone)]
pub struct RelayService {
    /// Host initiator configuration consulted by `GetInitiatorName`
    initiator_file: PathBuf,
}

impl RelayService {
    pub fn new(initiator_file: impl Into<PathBuf>) -> Self {
        Self {
            initiator_file: initiator_file.into(),
        }
    }
}

impl Default for RelayService {
    fn default() -> Self {
        Self::new(initiator::DEFAULT_INITIATOR_FILE)
    }
}

#[tonic::async_trait]
impl IscsiRelay for RelayService {
    #[instrument(skip(self, request))]
    async fn execute_command(
        &self,
        request: Request<ExecuteCommandRequest>,
    ) -> Result<Response<ExecuteCommandResponse>, Status> {
        let args = request.into_inner().args;
        let program = args.first().cloned().unwrap_or_default();

        info!(args = ?args, "ExecuteCommand request");

        let timer = CommandTimer::new(&program);
        match exec::run_command(&args).await {
            Ok(result) => {
                timer.success();
                Ok(Response::new(ExecuteCommandResponse { result }))
            }
            Err(e) => {
                let status = match &e {
                    RelayError::Spawn { .. } => "spawn_error",
                    RelayError::CommandFailed { .. } => "exit_error",
                    _ => "invalid",
                };
                timer.failure(status);
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, _request))]
    async fn get_initiator_name(
        &self,
        _request: Request<GetInitiatorNameRequest>,
    ) -> Result<Response<GetInitiatorNameResponse>, Status> {
        match initiator::read_initiator_name(&self.initiator_file).await {
            Ok(name) => {
                metrics::record_initiator_lookup(true);
                info!(initiator = %name, "GetInitiatorName served");
                Ok(Response::new(GetInitiatorNameResponse { name }))
            }
            Err(e) => {
                metrics::record_initiator_lookup(false);
                warn!(error = %e, "Initiator name lookup failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_command_returns_output() {
        let service = RelayService::default();
        let request = Request::new(ExecuteCommandRequest {
            args: vec!["echo".to_string(), "relayed".to_string()],
        });

        let response = service.execute_command(request).await.unwrap();
        assert_eq!(response.into_inner().result, "relayed\n");
    }

    #[tokio::test]
    async fn test_execute_command_empty_is_invalid() {
        let service = RelayService::default();
        let request = Request::new(ExecuteCommandRequest { args: vec![] });

        let status = service.execute_command(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_execute_command_failure_is_unknown_with_output() {
        let service = RelayService::default();
        let request = Request::new(ExecuteCommandRequest {
            args: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'iscsiadm: No active sessions.' >&2; exit 21".to_string(),
            ],
        });

        let status = service.execute_command(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert!(status.message().contains("No active sessions"));
    }

    #[tokio::test]
    async fn test_get_initiator_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("initiatorname.iscsi");
        std::fs::write(&path, "InitiatorName=iqn.2004-10.com.example:node7\n").unwrap();

        let service = RelayService::new(&path);
        let response = service
            .get_initiator_name(Request::new(GetInitiatorNameRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().name, "iqn.2004-10.com.example:node7");
    }

    #[tokio::test]
    async fn test_get_initiator_name_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let service = RelayService::new(dir.path().join("missing"));

        let status = service
            .get_initiator_name(Request::new(GetInitiatorNameRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}

//! Relay Client
//!
//! Forwards storage-admin argument vectors across the privilege boundary to
//! the iscsi-relay listening on a Unix socket.
//!
//! Every call carries a caller-supplied deadline. Exceeding it yields
//! [`RelayError::Timeout`], which means "unknown": the command may still be
//! running on the host and its side effects may land later. Callers re-query
//! observable state instead of assuming success or failure.

use std::path::PathBuf;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use iscsi_relay::listener::socket_path;
use iscsi_relay::proto::iscsi_relay_client::IscsiRelayClient;
use iscsi_relay::proto::{ExecuteCommandRequest, GetInitiatorNameRequest};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::metrics;

/// Connection establishment timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Privileged command execution, as seen from the constrained side.
#[tonic::async_trait]
pub trait CommandRelay: Send + Sync {
    /// Run `argv` on the host and return its combined output.
    async fn send(&self, argv: &[String], deadline: Duration) -> Result<String, RelayError>;

    /// Ask the host for its initiator name.
    async fn initiator_name(&self, deadline: Duration) -> Result<String, RelayError>;
}

/// gRPC client for the iscsi-relay.
#[derive(Debug, Clone)]
pub struct RelayClient {
    client: IscsiRelayClient<Channel>,
}

impl RelayClient {
    /// Build the channel endpoint for a `unix://` address.
    ///
    /// The URI given to tonic is a placeholder; the connector ignores it and
    /// dials the socket path instead.
    fn endpoint(address: &str) -> Result<(Endpoint, PathBuf), RelayError> {
        let path =
            socket_path(address).map_err(|_| RelayError::InvalidAddress(address.to_string()))?;

        let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(CONNECT_TIMEOUT);
        Ok((endpoint, path))
    }

    /// Connect to the relay, failing fast if the socket is not accepting.
    pub async fn connect(address: &str) -> Result<Self, RelayError> {
        let (endpoint, path) = Self::endpoint(address)?;

        let channel = endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await
            .map_err(|source| {
                metrics::record_connection_attempt(false);
                RelayError::Connect {
                    endpoint: address.to_string(),
                    source,
                }
            })?;

        metrics::record_connection_attempt(true);
        Ok(Self {
            client: IscsiRelayClient::new(channel),
        })
    }

    /// Create a client that dials on first use.
    ///
    /// The relay may start after the node plugin; connection errors then
    /// surface per call as [`RelayError::Relay`] with `Unavailable`.
    pub fn connect_lazy(address: &str) -> Result<Self, RelayError> {
        let (endpoint, path) = Self::endpoint(address)?;

        let channel = endpoint.connect_with_connector_lazy(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }));

        Ok(Self {
            client: IscsiRelayClient::new(channel),
        })
    }
}

#[tonic::async_trait]
impl CommandRelay for RelayClient {
    async fn send(&self, argv: &[String], deadline: Duration) -> Result<String, RelayError> {
        let program = argv.first().map(String::as_str).unwrap_or_default();
        debug!(args = ?argv, deadline = ?deadline, "Relaying command");

        let mut client = self.client.clone();
        let request = ExecuteCommandRequest {
            args: argv.to_vec(),
        };

        match tokio::time::timeout(deadline, client.execute_command(request)).await {
            Ok(Ok(response)) => {
                metrics::record_relay_call(program, "success");
                Ok(response.into_inner().result)
            }
            Ok(Err(status)) => {
                metrics::record_relay_call(program, "error");
                debug!(code = ?status.code(), message = %status.message(), "Relay returned error");
                Err(RelayError::Relay(status))
            }
            Err(_) => {
                metrics::record_relay_call(program, "timeout");
                warn!(args = ?argv, deadline = ?deadline, "Relay call timed out, outcome unknown");
                Err(RelayError::Timeout(deadline))
            }
        }
    }

    async fn initiator_name(&self, deadline: Duration) -> Result<String, RelayError> {
        let mut client = self.client.clone();

        match tokio::time::timeout(deadline, client.get_initiator_name(GetInitiatorNameRequest {}))
            .await
        {
            Ok(Ok(response)) => Ok(response.into_inner().name),
            Ok(Err(status)) => Err(RelayError::Relay(status)),
            Err(_) => Err(RelayError::Timeout(deadline)),
        }
    }
}

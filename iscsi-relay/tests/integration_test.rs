//! Integration tests for iscsi-relay
//!
//! These tests run the real relay service on a temporary Unix socket and
//! talk to it through the generated gRPC client, exercising the same path
//! the node plugin uses. Commands are harmless coreutils invocations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::service_fn;

use iscsi_relay::RelayService;
use iscsi_relay::listener;
use iscsi_relay::proto::iscsi_relay_client::IscsiRelayClient;
use iscsi_relay::proto::iscsi_relay_server::IscsiRelayServer;
use iscsi_relay::proto::{ExecuteCommandRequest, GetInitiatorNameRequest};

/// Start a relay on `socket` and return once it accepts connections.
async fn start_relay(socket: &Path, initiator_file: PathBuf) {
    let uds = listener::bind(socket, 0o600).expect("bind relay socket");
    let incoming = UnixListenerStream::new(uds);

    tokio::spawn(async move {
        Server::builder()
            .add_service(IscsiRelayServer::new(RelayService::new(initiator_file)))
            .serve_with_incoming(incoming)
            .await
            .expect("relay server");
    });
}

async fn connect(socket: &Path) -> IscsiRelayClient<Channel> {
    let socket = socket.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_timeout(Duration::from_secs(5))
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
        }))
        .await
        .expect("connect to relay");
    IscsiRelayClient::new(channel)
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// ExecuteCommand
// ============================================================================

#[tokio::test]
async fn test_execute_command_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("iscsi-socket/iscsi.sock");
    start_relay(&socket, dir.path().join("initiatorname.iscsi")).await;

    let mut client = connect(&socket).await;
    let response = client
        .execute_command(ExecuteCommandRequest {
            args: argv(&["echo", "-n", "session list"]),
        })
        .await
        .unwrap();

    assert_eq!(response.into_inner().result, "session list");
}

#[tokio::test]
async fn test_execute_command_nonzero_exit_reports_output() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("iscsi.sock");
    start_relay(&socket, dir.path().join("initiatorname.iscsi")).await;

    let mut client = connect(&socket).await;
    let status = client
        .execute_command(ExecuteCommandRequest {
            args: argv(&[
                "sh",
                "-c",
                "echo 'iscsiadm: default: 1 session requested, but 1 already present.' >&2; exit 15",
            ]),
        })
        .await
        .unwrap_err();

    assert_eq!(status.code(), tonic::Code::Unknown);
    assert!(status.message().contains("already present"));
}

#[tokio::test]
async fn test_concurrent_commands_are_not_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("iscsi.sock");
    start_relay(&socket, dir.path().join("initiatorname.iscsi")).await;

    let client = connect(&socket).await;
    let start = std::time::Instant::now();

    let calls = (0..4).map(|_| {
        let mut c = client.clone();
        async move {
            c.execute_command(ExecuteCommandRequest {
                args: argv(&["sleep", "0.5"]),
            })
            .await
        }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    // Four serialized sleeps would take at least two seconds
    assert!(start.elapsed() < Duration::from_millis(1900));
}

// ============================================================================
// GetInitiatorName
// ============================================================================

#[tokio::test]
async fn test_get_initiator_name_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("iscsi.sock");
    let initiator_file = dir.path().join("initiatorname.iscsi");
    std::fs::write(&initiator_file, "InitiatorName=iqn.2004-10.com.example:worker-1\n").unwrap();
    start_relay(&socket, initiator_file).await;

    let mut client = connect(&socket).await;
    let response = client
        .get_initiator_name(GetInitiatorNameRequest {})
        .await
        .unwrap();

    assert_eq!(response.into_inner().name, "iqn.2004-10.com.example:worker-1");
}

#[tokio::test]
async fn test_get_initiator_name_unconfigured() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("iscsi.sock");
    start_relay(&socket, dir.path().join("missing")).await;

    let mut client = connect(&socket).await;
    let status = client
        .get_initiator_name(GetInitiatorNameRequest {})
        .await
        .unwrap_err();

    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

// ============================================================================
// Listener lifecycle
// ============================================================================

#[tokio::test]
async fn test_restart_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("iscsi.sock");

    // Simulate a crashed instance leaving its socket file behind
    drop(listener::bind(&socket, 0o600).unwrap());
    assert!(socket.exists());

    start_relay(&socket, dir.path().join("initiatorname.iscsi")).await;
    let mut client = connect(&socket).await;
    let response = client
        .execute_command(ExecuteCommandRequest {
            args: argv(&["true"]),
        })
        .await
        .unwrap();

    assert_eq!(response.into_inner().result, "");
}

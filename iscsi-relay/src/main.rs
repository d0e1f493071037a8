use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use iscsi_relay::RelayService;
use iscsi_relay::initiator::DEFAULT_INITIATOR_FILE;
use iscsi_relay::listener;
use iscsi_relay::metrics;
use iscsi_relay::proto::iscsi_relay_server::IscsiRelayServer;

#[derive(Parser, Debug)]
#[command(name = "iscsi-relay")]
#[command(about = "Privileged iSCSI command relay for the CSI node plugin")]
struct Args {
    /// Unix socket to listen on
    #[arg(long, env = "RELAY_SOCKET", default_value = "unix:///iscsi-socket/iscsi.sock")]
    addr: String,

    /// Host initiator configuration file answered by GetInitiatorName
    #[arg(long, env = "INITIATOR_FILE", default_value = DEFAULT_INITIATOR_FILE)]
    initiator_file: PathBuf,

    /// Octal file mode applied to the socket (the only access control)
    #[arg(long, env = "RELAY_SOCKET_MODE", default_value = "660")]
    socket_mode: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9092)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let mode = u32::from_str_radix(&args.socket_mode, 8)
        .map_err(|e| format!("Invalid socket mode '{}': {}", args.socket_mode, e))?;
    let path = listener::socket_path(&args.addr)?;

    info!("Starting iscsi-relay on {}", path.display());
    info!("Initiator file: {}", args.initiator_file.display());
    info!("Socket mode: {:o}", mode);

    let uds = listener::bind(&path, mode)?;
    let incoming = UnixListenerStream::new(uds);

    Server::builder()
        .add_service(IscsiRelayServer::new(RelayService::new(args.initiator_file)))
        .serve_with_incoming_shutdown(incoming, async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(error = %e, "Failed to remove socket on shutdown");
    }

    info!("iscsi-relay shutdown complete");
    Ok(())
}

/// Wait for SIGTERM, SIGINT or SIGHUP.
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    let install = |kind: SignalKind, name: &str| match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install {} handler: {}", name, e);
            None
        }
    };

    let mut sigterm = install(SignalKind::terminate(), "SIGTERM");
    let mut sigint = install(SignalKind::interrupt(), "SIGINT");
    let mut sighup = install(SignalKind::hangup(), "SIGHUP");

    // Handlers that failed to install never fire
    async fn recv(sig: &mut Option<signal::unix::Signal>) {
        match sig {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    tokio::select! {
        _ = recv(&mut sigterm) => info!("Received SIGTERM"),
        _ = recv(&mut sigint) => info!("Received SIGINT"),
        _ = recv(&mut sighup) => info!("Received SIGHUP, shutting down"),
    }
}

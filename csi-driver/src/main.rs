//! iSCSI CSI Node Driver
//!
//! Serves the CSI Identity and Node services on a Unix socket and attaches
//! volumes through the privileged iscsi-relay.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use csi_driver::config::{DEFAULT_STATE_DIR, DEFAULT_VOLUMES_PER_NODE};
use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::csi::node_server::NodeServer;
use csi_driver::identity::DRIVER_NAME;
use csi_driver::initiator::DEFAULT_INITIATOR_FILE;
use csi_driver::{
    AttachConfig, AttachHints, AttachmentManager, IdentityService, InitiatorFile,
    IscsiadmClassifier, NodeConfig, NodeService, RelayClient, Role, SysfsDeviceResolver, metrics,
};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "iSCSI CSI node driver using a privileged command relay")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(
        long,
        env = "CSI_ENDPOINT",
        default_value = "unix:///var/lib/kubelet/plugins/iscsi-relay.csi.io/csi.sock"
    )]
    endpoint: String,

    /// Services to serve
    #[arg(long, env = "CSI_ROLE", value_enum, default_value = "all")]
    role: Role,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// iscsi-relay socket
    #[arg(long, env = "RELAY_SOCKET", default_value = "unix:///iscsi-socket/iscsi.sock")]
    relay_socket: String,

    /// Initiator configuration written on first use
    #[arg(long, env = "INITIATOR_FILE", default_value = DEFAULT_INITIATOR_FILE)]
    initiator_file: PathBuf,

    /// Directory holding per-volume staging records
    #[arg(long, env = "CSI_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Use only the first resolved path instead of dm-multipath
    #[arg(long, env = "CSI_DISABLE_MULTIPATH")]
    disable_multipath: bool,

    /// Required live sessions per volume, overriding the volume's replica count
    #[arg(long, env = "CSI_REPLICA_OVERRIDE")]
    replica_override: Option<u32>,

    /// Preferred portals, highest first (address or address:port)
    #[arg(long, env = "CSI_PREFERRED_PORTALS", value_delimiter = ',')]
    preferred_portals: Vec<String>,

    /// Maximum volumes reported through NodeGetInfo
    #[arg(long, env = "CSI_VOL_PER_NODE", default_value_t = DEFAULT_VOLUMES_PER_NODE)]
    max_volumes_per_node: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
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

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = DRIVER_NAME,
        endpoint = %args.endpoint,
        role = ?args.role,
        node_id = %node_id,
        relay_socket = %args.relay_socket,
        multipath = !args.disable_multipath,
        "Starting iSCSI CSI driver"
    );

    let node_service = if args.role.serves_node() {
        // The relay may come up after us; connect on first use
        let relay = Arc::new(RelayClient::connect_lazy(&args.relay_socket)?);

        let initiator = Arc::new(InitiatorFile::new(&args.initiator_file));
        match initiator.ensure(relay.as_ref()).await {
            Ok(true) => info!(path = %args.initiator_file.display(), "Initiator file bootstrapped"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Initiator bootstrap deferred to first attach"),
        }

        let attacher = AttachmentManager::new(
            relay,
            Arc::new(SysfsDeviceResolver::default()),
            Arc::new(IscsiadmClassifier),
            AttachConfig::default(),
        )
        .with_initiator_file(initiator);

        let config = NodeConfig {
            node_id,
            state_dir: args.state_dir,
            max_volumes_per_node: args.max_volumes_per_node,
            hints: AttachHints {
                multipath_enabled: !args.disable_multipath,
                replica_override: args.replica_override,
                preferred_portals: args.preferred_portals,
            },
        };
        Some(NodeServer::new(NodeService::new(config, Arc::new(attacher))))
    } else {
        None
    };

    let identity_service = args
        .role
        .serves_identity()
        .then(|| IdentityServer::new(IdentityService::new(args.role)));

    let path = iscsi_relay::listener::socket_path(&args.endpoint)?;
    let uds = iscsi_relay::listener::bind(&path, 0o660)?;
    let incoming = UnixListenerStream::new(uds);
    info!("CSI driver listening on {}", path.display());

    Server::builder()
        .add_optional_service(identity_service)
        .add_optional_service(node_service)
        .serve_with_incoming_shutdown(incoming, async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    if let Err(e) = std::fs::remove_file(&path) {
        warn!(error = %e, "Failed to remove socket on shutdown");
    }

    info!("CSI driver shutdown complete");
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

//! Forward one admin command to the iscsi-relay.
//!
//! Drop-in stand-in for `iscsiadm` inside the node container: bootstraps the
//! initiator file on first use, relays the argument vector and prints the
//! host's combined output.
//!
//! ```text
//! iscsi-send -- iscsiadm -m session
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error};
use tracing_subscriber::FmtSubscriber;

use csi_driver::initiator::DEFAULT_INITIATOR_FILE;
use csi_driver::{CommandRelay, InitiatorFile, RelayClient};

#[derive(Parser, Debug)]
#[command(name = "iscsi-send")]
#[command(about = "Run a storage-admin command on the host through the iscsi-relay")]
struct Args {
    /// iscsi-relay socket
    #[arg(long, env = "RELAY_SOCKET", default_value = "unix:///iscsi-socket/iscsi.sock")]
    addr: String,

    /// Initiator configuration written on first use
    #[arg(long, env = "INITIATOR_FILE", default_value = DEFAULT_INITIATOR_FILE)]
    initiator_file: PathBuf,

    /// Deadline for the relayed command in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Argument vector, including the program name
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    argv: Vec<String>,
}

async fn run(args: Args) -> Result<String, csi_driver::RelayError> {
    let relay = RelayClient::connect(&args.addr).await?;

    if InitiatorFile::new(&args.initiator_file)
        .ensure(&relay)
        .await?
    {
        debug!(path = %args.initiator_file.display(), "Wrote initiator file");
    }

    relay
        .send(&args.argv, Duration::from_millis(args.timeout_ms))
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = args.log_level.parse().unwrap_or(Level::WARN);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {}", e);
    }

    match run(args).await {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Relay call failed");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

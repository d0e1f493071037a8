//! Prometheus metrics for the iSCSI relay
//!
//! Tracks relayed commands and initiator lookups.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Relayed commands by program and status
    pub const RELAY_COMMANDS_TOTAL: &str = "iscsi_relay_commands_total";
    /// Histogram: Duration of relayed commands in seconds
    pub const RELAY_COMMAND_DURATION_SECONDS: &str = "iscsi_relay_command_duration_seconds";
    /// Counter: Initiator name lookups by status
    pub const INITIATOR_LOOKUPS_TOTAL: &str = "iscsi_relay_initiator_lookups_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a relayed command with its result
pub fn record_command(program: &str, status: &str, duration_secs: f64) {
    counter!(names::RELAY_COMMANDS_TOTAL, "program" => program.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::RELAY_COMMAND_DURATION_SECONDS, "program" => program.to_string())
        .record(duration_secs);
}

/// Record an initiator name lookup
pub fn record_initiator_lookup(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(names::INITIATOR_LOOKUPS_TOTAL, "status" => status).increment(1);
}

/// Helper for timing relayed commands
pub struct CommandTimer {
    program: String,
    start: Instant,
}

impl CommandTimer {
    /// Start timing a command
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the command with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_command(&self.program, "success", duration);
    }

    /// Complete the command with failure
    pub fn failure(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_command(&self.program, status, duration);
    }
}

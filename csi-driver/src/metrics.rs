//! Prometheus metrics for the CSI driver
//!
//! Covers attach/detach operations, relay traffic, login retries and
//! device polling.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of node operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of node operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: Relay calls by program and result (success, error, timeout)
    pub const CSI_RELAY_CALLS_TOTAL: &str = "csi_relay_calls_total";
    /// Counter: Number of relay connection attempts
    pub const CSI_RELAY_CONNECTION_ATTEMPTS: &str = "csi_relay_connection_attempts";
    /// Counter: Number of retried operations
    pub const CSI_RETRIES_TOTAL: &str = "csi_retries_total";
    /// Counter: Device resolution polls by result (found, pending)
    pub const CSI_DEVICE_POLLS_TOTAL: &str = "csi_device_polls_total";
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

/// Record a node operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a relayed command
pub fn record_relay_call(program: &str, result: &str) {
    counter!(names::CSI_RELAY_CALLS_TOTAL, "program" => program.to_string(), "result" => result.to_string())
        .increment(1);
}

/// Record a relay connection attempt
pub fn record_connection_attempt(success: bool) {
    counter!(names::CSI_RELAY_CONNECTION_ATTEMPTS, "success" => success.to_string()).increment(1);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::CSI_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record one device resolution poll
pub fn record_device_poll(found: bool) {
    let result = if found { "found" } else { "pending" };
    counter!(names::CSI_DEVICE_POLLS_TOTAL, "result" => result).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_kind: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_kind, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_noop() {
        // No recorder installed: every call must be a silent no-op
        let timer = OperationTimer::new("attach");
        record_relay_call("iscsiadm", "success");
        record_device_poll(false);
        record_retry("login");
        timer.failure("partial_login");
    }
}

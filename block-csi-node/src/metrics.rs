//! Prometheus metrics for the node plugin
//!
//! Covers CSI node operations, SCSI rescans, device polling and
//! conflicts detected while staging.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI node operations by type and status
    pub const OPERATIONS_TOTAL: &str = "csi_node_operations_total";
    /// Histogram: Duration of CSI node operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "csi_node_operation_duration_seconds";
    /// Counter: Rescan trigger writes to SCSI host scan files
    pub const RESCAN_WRITES_TOTAL: &str = "csi_node_rescan_writes_total";
    /// Counter: Glob attempts while waiting for a device node
    pub const DEVICE_POLL_ATTEMPTS_TOTAL: &str = "csi_node_device_poll_attempts_total";
    /// Counter: Requests rejected because of conflicting state
    pub const VOLUME_CONFLICTS_TOTAL: &str = "csi_node_volume_conflicts_total";
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

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn record_rescan_write(transport: &str) {
    counter!(names::RESCAN_WRITES_TOTAL, "transport" => transport.to_string()).increment(1);
}

pub fn record_device_poll(transport: &str) {
    counter!(names::DEVICE_POLL_ATTEMPTS_TOTAL, "transport" => transport.to_string())
        .increment(1);
}

/// `reason` is one of `in_flight`, `mounted_elsewhere` or `staging_occupied`.
pub fn record_conflict(reason: &str) {
    counter!(names::VOLUME_CONFLICTS_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}

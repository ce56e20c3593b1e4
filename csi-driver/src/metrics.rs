//! Prometheus metrics for the CSI driver
//!
//! Provides metrics for monitoring CSI operations and the driver's calls to
//! the control plane.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: Control-plane HTTP requests by operation and response status
    pub const CSI_CONTROL_PLANE_REQUESTS_TOTAL: &str = "csi_control_plane_requests_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint. Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a control-plane request; `status` is the HTTP status or "error"
pub fn record_control_plane_request(operation: &str, status: &str) {
    counter!(names::CSI_CONTROL_PLANE_REQUESTS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
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
    pub fn failure(self, status: &tonic::Status) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, &format!("{:?}", status.code()), duration);
    }

    /// Record the outcome of an RPC result and pass it through.
    pub fn observe<T>(self, result: Result<T, tonic::Status>) -> Result<T, tonic::Status> {
        match &result {
            Ok(_) => self.success(),
            Err(status) => self.failure(status),
        }
        result
    }
}

//! Prometheus metrics for SCSI device lifecycle and device-node operations.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total operations by type and status
    pub const OPERATIONS_TOTAL: &str = "scsi_device_operations_total";
    /// Histogram: Duration of operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "scsi_device_operation_duration_seconds";
    /// Gauge: 1 while the target's device is attached, 0 otherwise
    pub const ATTACHED: &str = "scsi_device_attached";
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

/// Record an operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Mark a target's device as attached or detached
pub fn set_attached(target: &str, attached: bool) {
    gauge!(names::ATTACHED, "target" => target.to_string()).set(if attached { 1.0 } else { 0.0 });
}

/// Timer that records the operation when finished
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        record_operation(self.operation, "success", self.start.elapsed().as_secs_f64());
    }

    pub fn failure(self) {
        record_operation(self.operation, "failure", self.start.elapsed().as_secs_f64());
    }

    /// Record according to `result` and hand it back unchanged
    pub fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E> {
        match &result {
            Ok(_) => self.success(),
            Err(_) => self.failure(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer_passes_result_through() {
        let ok: Result<u32, &str> = OperationTimer::new("test_operation").finish(Ok(7));
        assert_eq!(ok, Ok(7));

        // Recording without an installed recorder is a no-op
        let err: Result<u32, &str> = OperationTimer::new("test_operation").finish(Err("boom"));
        assert_eq!(err, Err("boom"));
    }
}

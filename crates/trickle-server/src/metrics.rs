//! Metrics collection and export for Trickle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use trickle_core::DeliveryReport;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "trickle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "trickle_connections_active";
    pub const MESSAGES_TOTAL: &str = "trickle_messages_total";
    pub const MESSAGES_BYTES: &str = "trickle_messages_bytes";
    pub const DELIVERIES_TOTAL: &str = "trickle_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "trickle_deliveries_dropped_total";
    pub const PUBLISH_LATENCY_SECONDS: &str = "trickle_publish_latency_seconds";
    pub const ERRORS_TOTAL: &str = "trickle_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of frames queued to connections"
    );
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Connections dropped because their transport was gone"
    );
    metrics::describe_histogram!(
        names::PUBLISH_LATENCY_SECONDS,
        "Time from publish to delivery into every sink, in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection(transport: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "transport" => transport).increment(1);
}

/// Update the active connection count.
pub fn set_active_connections(count: usize) {
    gauge!(names::CONNECTIONS_ACTIVE).set(count as f64);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the outcome of one broadcast.
pub fn record_delivery(report: &DeliveryReport, latency: Duration) {
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    if report.dropped > 0 {
        counter!(names::DELIVERIES_DROPPED).increment(report.dropped as u64);
    }
    histogram!(names::PUBLISH_LATENCY_SECONDS).record(latency.as_secs_f64());
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

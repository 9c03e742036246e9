//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (calls, latency, handlers, refreshes)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_rpc_total` (counter): calls by protocol, method, code
//! - `gateway_rpc_duration_seconds` (histogram): call latency
//! - `gateway_registered_handlers` (gauge): handlers per remote connection
//! - `gateway_reflection_refresh_total` (counter): refreshes by connection, outcome
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; with no exporter
//!   installed every call is a no-op
//! - Labels for protocol, method and status code name

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;
use tonic::Code;

use crate::http::status::code_name;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install metrics exporter"),
    }
}

/// Count one finished call and its latency.
pub fn record_rpc(protocol: &'static str, method: &str, code: Code, start: Instant) {
    let labels = [
        ("protocol", protocol.to_string()),
        ("method", method.to_string()),
        ("code", code_name(code).to_string()),
    ];
    ::metrics::counter!("gateway_rpc_total", &labels).increment(1);
    ::metrics::histogram!("gateway_rpc_duration_seconds", &labels[..2])
        .record(start.elapsed().as_secs_f64());
}

/// Publish how many handlers a remote connection currently serves.
pub fn record_registration(conn: &str, handlers: usize) {
    ::metrics::gauge!("gateway_registered_handlers", "conn" => conn.to_string()).set(handlers as f64);
}

/// Count one reflection refresh.
pub fn record_refresh(conn: &str, outcome: &'static str) {
    ::metrics::counter!(
        "gateway_reflection_refresh_total",
        "conn" => conn.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

//! Metrics collection and exposition.
//!
//! # Metrics
//! - `livereload_proxy_requests_total` (counter): forwarded requests by target (origin, upgrade)
//! - `livereload_injections_total` (counter): responses that received the snippet
//! - `livereload_interceptor_failures_total` (counter): responses failed by a handler
//! - `livereload_connections_active` (gauge): registered websocket connections
//! - `livereload_broadcasts_total` (counter): reload broadcasts triggered
//! - `livereload_deliveries_total` (counter): per-connection deliveries by outcome

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter")
        }
    }
}

pub fn record_request(target: &'static str) {
    counter!("livereload_proxy_requests_total", "target" => target).increment(1);
}

pub fn record_injection() {
    counter!("livereload_injections_total").increment(1);
}

pub fn record_interceptor_failure() {
    counter!("livereload_interceptor_failures_total").increment(1);
}

pub fn record_connections(active: usize) {
    gauge!("livereload_connections_active").set(active as f64);
}

pub fn record_broadcast() {
    counter!("livereload_broadcasts_total").increment(1);
}

pub fn record_delivery(outcome: &'static str) {
    counter!("livereload_deliveries_total", "outcome" => outcome).increment(1);
}

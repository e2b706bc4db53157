//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "parley_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "parley_sessions_active";
    pub const FRAMES_TOTAL: &str = "parley_frames_total";
    pub const FRAMES_BYTES: &str = "parley_frames_bytes";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const PRESENCE_UPDATES_TOTAL: &str = "parley_presence_updates_total";
    pub const ONLINE_USERS: &str = "parley_online_users";
    pub const BACKEND_SWITCHES_TOTAL: &str = "parley_backend_switches_total";
    pub const LATENCY_SECONDS: &str = "parley_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of session channels since server start"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Current number of open session channels"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Session frames by direction");
    metrics::describe_counter!(names::FRAMES_BYTES, "Session frame bytes by direction");
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Chat messages by direction (sent, delivered)"
    );
    metrics::describe_counter!(
        names::PRESENCE_UPDATES_TOTAL,
        "Presence snapshots fanned out"
    );
    metrics::describe_gauge!(names::ONLINE_USERS, "Users in the latest presence snapshot");
    metrics::describe_counter!(
        names::BACKEND_SWITCHES_TOTAL,
        "Backend switch requests by outcome"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by type");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a session frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a chat message.
pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Record a presence snapshot.
pub fn record_presence(online: usize) {
    counter!(names::PRESENCE_UPDATES_TOTAL).increment(1);
    gauge!(names::ONLINE_USERS).set(online as f64);
}

/// Record a backend switch request.
pub fn record_backend_switch(backend: &str, outcome: &'static str) {
    counter!(
        names::BACKEND_SWITCHES_TOTAL,
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record inbound frame latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records the session end on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session start.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        let _guard = SessionMetricsGuard::new();
        record_frame(42, "inbound");
        record_message("sent");
        record_presence(3);
        record_backend_switch("memory", "ok");
        record_error("decode");
    }
}

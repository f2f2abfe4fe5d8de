//! Metrics collection.
//!
//! # Responsibilities
//! - Define proxy metrics (admissions, handshakes, failures, traffic, connections)
//! - Track per-route traffic and aggregate outcomes
//!
//! # Metrics
//! - `tls_client_streams_total` (counter): application streams by outcome
//! - `tls_client_handshakes_total` (counter): handshakes by outcome
//! - `tls_client_stream_failures_total` (counter): stream-level failures by kind
//! - `tls_client_frames_total` (counter): frames by route and direction
//! - `tls_client_bytes_total` (counter): payload bytes by route and direction
//! - `tls_client_active_connections` (gauge): live stream pairs
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Labels are static strings except for the route name
//! - No recorder is installed here; without one every call is a no-op

use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn metric emission on or off for the whole process.
pub fn init_metrics(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
    tracing::debug!(enabled, "Metrics configured");
}

fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Record an admission decision for an application stream.
pub fn record_stream(outcome: &'static str) {
    if enabled() {
        ::metrics::counter!("tls_client_streams_total", "outcome" => outcome).increment(1);
    }
}

pub fn record_handshake(outcome: &'static str) {
    if enabled() {
        ::metrics::counter!("tls_client_handshakes_total", "outcome" => outcome).increment(1);
    }
}

pub fn record_stream_failure(kind: &'static str) {
    if enabled() {
        ::metrics::counter!("tls_client_stream_failures_total", "kind" => kind).increment(1);
    }
}

/// Record one frame and its payload bytes on a route.
pub fn record_frame(route: &str, direction: &'static str, bytes: usize) {
    if enabled() {
        let route = route.to_string();
        ::metrics::counter!("tls_client_frames_total", "route" => route.clone(), "direction" => direction)
            .increment(1);
        ::metrics::counter!("tls_client_bytes_total", "route" => route, "direction" => direction)
            .increment(bytes as u64);
    }
}

pub fn record_active_connections(count: u64) {
    if enabled() {
        ::metrics::gauge!("tls_client_active_connections").set(count as f64);
    }
}

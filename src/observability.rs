use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings accepted.
pub const BOOKINGS_CREATED_TOTAL: &str = "turnstile_bookings_created_total";

/// Counter: booking requests refused because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "turnstile_booking_conflicts_total";

/// Counter: successful check-ins.
pub const CHECKINS_TOTAL: &str = "turnstile_checkins_total";

/// Counter: check-ins refused (bad token, stale token, outside window).
pub const CHECKIN_FAILURES_TOTAL: &str = "turnstile_checkin_failures_total";

/// Counter: pending bookings written back as expired.
pub const BOOKINGS_LAPSED_TOTAL: &str = "turnstile_bookings_lapsed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "turnstile_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "turnstile_wal_flush_batch_size";

/// Counter: artifact releases that the renderer reported as failed.
pub const ARTIFACT_RELEASE_FAILURES_TOTAL: &str = "turnstile_artifact_release_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Structured log output for embedding binaries that don't bring their own
/// subscriber.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}

use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "salond_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "salond_http_request_duration_seconds";

/// Counter: availability queries answered.
pub const AVAILABILITY_QUERIES_TOTAL: &str = "salond_availability_queries_total";

/// Histogram: availability computation time in seconds.
pub const AVAILABILITY_DURATION_SECONDS: &str = "salond_availability_duration_seconds";

// ── Domain events ───────────────────────────────────────────────

pub const RESERVATIONS_CREATED_TOTAL: &str = "salond_reservations_created_total";
pub const RESERVATIONS_UPDATED_TOTAL: &str = "salond_reservations_updated_total";
pub const RESERVATIONS_DELETED_TOTAL: &str = "salond_reservations_deleted_total";

/// Counter: writes rejected because the slot was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "salond_reservation_conflicts_total";

/// Counter: reorder operations. Labels: family.
pub const REORDERS_TOTAL: &str = "salond_reorders_total";

/// Counter: notification sends. Labels: channel, status.
pub const NOTIFICATIONS_TOTAL: &str = "salond_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salond_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salond_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "salond_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Status class label, so per-status series stay bounded.
pub fn status_label(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

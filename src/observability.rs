use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "dispatch_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "dispatch_http_request_duration_seconds";

/// Counter: authentication or authorization failures. Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "dispatch_auth_failures_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: assignments committed.
pub const ASSIGNMENTS_CREATED_TOTAL: &str = "dispatch_assignments_created_total";

/// Counter: writes rejected by the conflict checks. Labels: reason.
pub const ASSIGNMENT_CONFLICTS_TOTAL: &str = "dispatch_assignment_conflicts_total";

/// Counter: notification tasks accepted. Labels: kind.
pub const NOTIFICATIONS_ENQUEUED_TOTAL: &str = "dispatch_notifications_enqueued_total";

/// Counter: notification tasks refused at enqueue. Labels: reason.
pub const NOTIFICATIONS_REJECTED_TOTAL: &str = "dispatch_notifications_rejected_total";

/// Counter: notification tasks delivered. Labels: kind.
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "dispatch_notifications_delivered_total";

/// Counter: notification tasks that ran out of attempts. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "dispatch_notifications_failed_total";

/// Counter: individual delivery attempts, retries included.
pub const NOTIFICATION_ATTEMPTS_TOTAL: &str = "dispatch_notification_attempts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "dispatch_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "dispatch_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "dispatch_wal_compactions_total";

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

use std::net::SocketAddr;

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: reservations created. Labels: path (`immediate` | `deferred`).
pub const RESERVATIONS_CREATED_TOTAL: &str = "parkledger_reservations_created_total";

/// Counter: reserve / confirm attempts rejected for overlap.
pub const RESERVE_CONFLICTS_TOTAL: &str = "parkledger_reserve_conflicts_total";

/// Counter: reservations deactivated. Labels: reason.
pub const RELEASES_TOTAL: &str = "parkledger_releases_total";

/// Counter: duplicate payment confirmations answered with the existing reservation.
pub const DUPLICATE_CONFIRMATIONS_TOTAL: &str = "parkledger_duplicate_confirmations_total";

// ── Sweep metrics ───────────────────────────────────────────────

/// Histogram: sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "parkledger_sweep_duration_seconds";

/// Counter: sweep transitions. Labels: rule.
pub const SWEEP_TRANSITIONS_TOTAL: &str = "parkledger_sweep_transitions_total";

/// Counter: per-record errors logged and skipped during a sweep.
pub const SWEEP_ERRORS_TOTAL: &str = "parkledger_sweep_errors_total";

// ── Delivery + storage ──────────────────────────────────────────

/// Counter: notices a sink failed to deliver.
pub const NOTIFY_FAILURES_TOTAL: &str = "parkledger_notify_failures_total";

/// Counter: refunds requested after a confirmation lost its slot.
pub const REFUNDS_REQUESTED_TOTAL: &str = "parkledger_refunds_requested_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkledger_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

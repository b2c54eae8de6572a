use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

/// Counter: statements refused because the caller is not an operator. Labels: command.
pub const PRIVILEGE_DENIALS_TOTAL: &str = "slotbook_privilege_denials_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL append + fsync duration in seconds, one per committed block.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Counter: atomic blocks committed with at least one write.
pub const COMMITS_TOTAL: &str = "slotbook_commits_total";

/// Histogram: time spent waiting for the store write lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotbook_lock_wait_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings confirmed.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

/// Counter: booking attempts that failed. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "slotbook_bookings_rejected_total";

/// Counter: bookings moved to cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotbook_bookings_cancelled_total";

/// Counter: unit releases on a slot whose booked_count was already zero.
pub const LEDGER_UNDERFLOW_TOTAL: &str = "slotbook_ledger_underflow_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlot { .. } => "insert_slot",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookableSlots { .. } => "select_bookable_slots",
        Command::SelectBookableDays => "select_bookable_days",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookingsForSlot { .. } => "select_bookings_for_slot",
    }
}

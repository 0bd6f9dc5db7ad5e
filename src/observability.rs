use std::net::SocketAddr;

use crate::model::{Event, ReleaseReason};
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courthold_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courthold_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courthold_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courthold_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courthold_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courthold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courthold_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "courthold_wal_compactions_total";

// ── Hold lifecycle ──────────────────────────────────────────────

pub const HOLDS_ACQUIRED_TOTAL: &str = "courthold_holds_acquired_total";

pub const HOLDS_RENEWED_TOTAL: &str = "courthold_holds_renewed_total";

/// Counter: holds that left without promotion. Labels: reason (released, expired).
pub const HOLDS_RELEASED_TOTAL: &str = "courthold_holds_released_total";

pub const HOLDS_PROMOTED_TOTAL: &str = "courthold_holds_promoted_total";

pub const BOOKINGS_CANCELLED_TOTAL: &str = "courthold_bookings_cancelled_total";

/// Counter: acquisitions rejected because the slot was taken.
pub const CONFLICTS_TOTAL: &str = "courthold_conflicts_total";

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

/// Count a committed engine event.
pub fn record_event(event: &Event) {
    match event {
        Event::HoldAcquired { .. } => metrics::counter!(HOLDS_ACQUIRED_TOTAL).increment(1),
        Event::HoldRenewed { .. } => metrics::counter!(HOLDS_RENEWED_TOTAL).increment(1),
        Event::HoldReleased { reason, .. } => {
            let reason = match reason {
                ReleaseReason::Released => "released",
                ReleaseReason::Expired => "expired",
            };
            metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => reason).increment(1);
        }
        Event::HoldPromoted { .. } => metrics::counter!(HOLDS_PROMOTED_TOTAL).increment(1),
        Event::BookingCancelled { .. } => {
            metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1)
        }
        Event::Batch { events } => events.iter().for_each(record_event),
        Event::CourtCreated { .. } | Event::CourtDeleted { .. } | Event::BookingRestored { .. } => {}
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCourt { .. } => "insert_court",
        Command::DeleteCourt { .. } => "delete_court",
        Command::InsertHold { .. } => "insert_hold",
        Command::InsertHolds { .. } => "insert_holds",
        Command::InsertFixedHold { .. } => "insert_fixed_hold",
        Command::RenewHold { .. } => "renew_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::DeleteHolderHolds { .. } => "delete_holder_holds",
        Command::InsertBooking { .. } => "insert_booking",
        Command::Checkout { .. } => "checkout",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectCourts { .. } => "select_courts",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectBlockedStartTimes { .. } => "select_blocked_start_times",
        Command::SelectFreeTime { .. } => "select_free_time",
        Command::SelectPrices { .. } => "select_prices",
        Command::SelectCart { .. } => "select_cart",
    }
}

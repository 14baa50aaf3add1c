use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "keyturn_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "keyturn_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "keyturn_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "keyturn_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "keyturn_connections_rejected_total";

/// Counter: logins refused before the password check.
pub const AUTH_FAILURES_TOTAL: &str = "keyturn_auth_failures_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "keyturn_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "keyturn_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "keyturn_wal_flush_batch_size";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: accepted submissions. Labels: mode.
pub const RESERVATIONS_SUBMITTED_TOTAL: &str = "keyturn_reservations_submitted_total";

/// Counter: submissions refused because the window was taken.
pub const CONFLICTS_TOTAL: &str = "keyturn_conflicts_total";

/// Counter: committed status changes. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "keyturn_transitions_total";

/// Counter: requests expired or abandoned by the clock.
pub const EXPIRIES_TOTAL: &str = "keyturn_expiries_total";

/// Counter: payment holds released.
pub const HOLDS_RELEASED_TOTAL: &str = "keyturn_holds_released_total";

/// Counter: failed captures.
pub const PAYMENT_FAILURES_TOTAL: &str = "keyturn_payment_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| io::Error::other(format!("failed to install Prometheus exporter: {e}")))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::InsertLocation { .. } => "insert_location",
        Command::DeleteLocation { .. } => "delete_location",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertDecision { .. } => "insert_decision",
        Command::InsertPayment { .. } => "insert_payment",
        Command::InsertCancellation { .. } => "insert_cancellation",
        Command::SelectVehicles => "select_vehicles",
        Command::SelectLocations => "select_locations",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectBlocked { .. } => "select_blocked",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectQuote { .. } => "select_quote",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn labels_are_snake_case() {
        assert_eq!(command_label(&Command::SelectVehicles), "select_vehicles");
        assert_eq!(
            command_label(&Command::InsertPayment { reservation_id: Ulid::new() }),
            "insert_payment"
        );
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }
}

use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "farmslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "farmslot_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (booked, conflict, machine_not_found, invalid, failed).
pub const BOOKINGS_TOTAL: &str = "farmslot_bookings_total";

/// Histogram: end-to-end booking latency in seconds, commit included.
pub const BOOKING_DURATION_SECONDS: &str = "farmslot_booking_duration_seconds";

/// Counter: slots reserved by committed bookings.
pub const SLOTS_RESERVED_TOTAL: &str = "farmslot_slots_reserved_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "farmslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "farmslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "farmslot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "farmslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "farmslot_wal_flush_batch_size";

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
        Command::InsertMachine { .. } => "insert_machine",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectMachines => "select_machines",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectBookedSlots { .. } => "select_booked_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectInvoice { .. } => "select_invoice",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_distinct() {
        let id = ulid::Ulid::new();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let labels = [
            command_label(&Command::SelectMachines),
            command_label(&Command::SelectAvailability { machine_id: id, date }),
            command_label(&Command::SelectBookedSlots { machine_id: id, date }),
            command_label(&Command::SelectBookings { farmer_id: id }),
            command_label(&Command::SelectInvoice { id }),
        ];
        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), labels.len());
    }
}

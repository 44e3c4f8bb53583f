use std::net::SocketAddr;

use crate::wire::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "roombook_requests_total";

/// Histogram: request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "roombook_request_duration_seconds";

/// Counter: booking writes refused. Labels: code.
pub const BOOKINGS_REJECTED_TOTAL: &str = "roombook_bookings_rejected_total";

/// Counter: successful status transitions. Labels: transition.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "roombook_booking_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Counter: failed logins.
pub const AUTH_FAILURES_TOTAL: &str = "roombook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::warn!("metrics exporter disabled: {e}"),
    }
}

/// Short, stable label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Login { .. } => "login",
        Command::Whoami => "whoami",
        Command::CreateRoom { .. } => "create_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::GetRoom { .. } => "get_room",
        Command::ListRooms { .. } => "list_rooms",
        Command::RegisterUser { .. } => "register_user",
        Command::UpdateUser { .. } => "update_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::GetUser { .. } => "get_user",
        Command::ListUsers => "list_users",
        Command::CreateBooking { .. } => "create_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::GetBooking { .. } => "get_booking",
        Command::ListBookings { .. } => "list_bookings",
        Command::RoomBookings { .. } => "room_bookings",
        Command::UserBookings { .. } => "user_bookings",
        Command::TodayBookings => "today_bookings",
        Command::PendingBookings => "pending_bookings",
        Command::FindConflicts { .. } => "find_conflicts",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}

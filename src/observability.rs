use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "salond_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "salond_query_duration_seconds";

// ── Domain outcomes ─────────────────────────────────────────────

/// Counter: appointments committed. Labels: origin.
pub const APPOINTMENTS_CREATED_TOTAL: &str = "salond_appointments_created_total";

/// Counter: bookings and reschedules that lost the slot at commit time.
pub const SLOT_CONFLICTS_TOTAL: &str = "salond_slot_conflicts_total";

/// Counter: refused plan-covered bookings. Labels: reason.
pub const ENTITLEMENT_DENIALS_TOTAL: &str = "salond_entitlement_denials_total";

/// Counter: cancellations. Labels: actor, penalized.
pub const CANCELLATIONS_TOTAL: &str = "salond_cancellations_total";

/// Counter: reschedules refused inside the notice window.
pub const RESCHEDULES_BLOCKED_TOTAL: &str = "salond_reschedules_blocked_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "salond_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "salond_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "salond_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "salond_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "salond_journal_flush_batch_size";

/// Counter: completed compactions.
pub const JOURNAL_COMPACTIONS_TOTAL: &str = "salond_journal_compactions_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::InsertCancellation { .. } => "insert_cancellation",
        Command::InsertReschedule { .. } => "insert_reschedule",
        Command::InsertTransition { .. } => "insert_transition",
        Command::InsertPayment { .. } => "insert_payment",
        Command::InsertHidden { .. } => "insert_hidden",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::InsertSubscription { .. } => "insert_subscription",
        Command::InsertPlanChange { .. } => "insert_plan_change",
        Command::InsertSubscriptionStatus { .. } => "insert_subscription_status",
        Command::DeleteSubscription { .. } => "delete_subscription",
        Command::SelectEntitlement { .. } => "select_entitlement",
    }
}

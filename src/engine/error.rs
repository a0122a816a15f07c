use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms};

/// Why a plan-covered booking was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    PlanInactive,
    ServiceNotCovered,
    MonthlyLimitReached,
    WeeklyLimitReached,
    FacialLimitReached,
}

impl DenialReason {
    pub fn label(&self) -> &'static str {
        match self {
            DenialReason::PlanInactive => "plan_inactive",
            DenialReason::ServiceNotCovered => "service_not_covered",
            DenialReason::MonthlyLimitReached => "monthly_limit_reached",
            DenialReason::WeeklyLimitReached => "weekly_limit_reached",
            DenialReason::FacialLimitReached => "facial_limit_reached",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug)]
pub enum EngineError {
    SlotConflict(Ulid),
    EntitlementDenied(DenialReason),
    RescheduleBlocked { hours_until: f64 },
    AlreadyTerminal(AppointmentStatus),
    ClosedDay(NaiveDate),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Start time is not an offered slot (off-grid, too soon, or outside hours).
    NotBookable(Ms),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    NotOwner(Ulid),
    CommitmentActive(NaiveDate),
    SubscriptionInactive(Ulid),
    LimitExceeded(&'static str),
    /// Broken internal reference; indicates a bug, never user-actionable.
    Integrity(String),
    JournalError(String),
}

impl EngineError {
    /// Expected outcomes that callers branch on, as opposed to failures.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, EngineError::Integrity(_) | EngineError::JournalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotConflict(id) => {
                write!(f, "slot no longer available: conflicts with appointment {id}")
            }
            EngineError::EntitlementDenied(reason) => write!(f, "entitlement denied: {reason}"),
            EngineError::RescheduleBlocked { hours_until } => write!(
                f,
                "reschedule blocked: appointment starts in {hours_until:.1}h"
            ),
            EngineError::AlreadyTerminal(status) => {
                write!(f, "appointment is already {status}")
            }
            EngineError::ClosedDay(date) => write!(f, "closed on {date}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotBookable(start) => write!(f, "start {start} is not a bookable slot"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::NotOwner(id) => write!(f, "appointment {id} belongs to another client"),
            EngineError::CommitmentActive(until) => {
                write!(f, "minimum commitment runs until {until}")
            }
            EngineError::SubscriptionInactive(id) => write!(f, "subscription {id} is not active"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Integrity(msg) => write!(f, "internal integrity error: {msg}"),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

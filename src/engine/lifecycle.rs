use crate::model::AppointmentStatus::*;
use crate::model::*;

use super::EngineError;

pub fn is_terminal(status: AppointmentStatus) -> bool {
    matches!(status, Completed | Canceled | NoShow)
}

/// Legal edges: Pending → Confirmed → Completed | NoShow, and
/// Pending | Confirmed → Canceled. Nothing leaves a terminal state.
pub fn check_transition(from: AppointmentStatus, to: AppointmentStatus) -> Result<(), EngineError> {
    if is_terminal(from) {
        return Err(EngineError::AlreadyTerminal(from));
    }
    match (from, to) {
        (Pending, Confirmed) | (Confirmed, Completed) | (Confirmed, NoShow) => Ok(()),
        (Pending | Confirmed, Canceled) => Ok(()),
        _ => Err(EngineError::InvalidTransition { from, to }),
    }
}

/// Client single/voucher bookings await confirmation; plan-covered and
/// staff-created ones start confirmed.
pub fn initial_status(origin: Origin) -> AppointmentStatus {
    match origin {
        Origin::Single | Origin::Voucher => Pending,
        Origin::Subscription | Origin::AdminCreated => Confirmed,
    }
}

pub fn initial_payment(origin: Origin) -> PaymentStatus {
    match origin {
        Origin::Single | Origin::AdminCreated => PaymentStatus::Pending,
        Origin::Subscription | Origin::Voucher => PaymentStatus::None,
    }
}

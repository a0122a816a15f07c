use crate::config::SystemConfig;
use crate::model::*;

use super::EngineError;

/// Hours between `now` and `start`, fractional, negative once started.
pub fn hours_until(start: Ms, now: Ms) -> f64 {
    (start - now) as f64 / HOUR_MS as f64
}

/// Cancellation is always allowed; inside the notice window it is penalized,
/// whoever cancels.
pub fn cancellation_penalized(config: &SystemConfig, start: Ms, now: Ms) -> bool {
    start - now < config.min_cancellation_hours * HOUR_MS
}

/// Reschedule is refused outright inside the notice window.
pub fn check_reschedule(config: &SystemConfig, start: Ms, now: Ms) -> Result<(), EngineError> {
    if start - now < config.min_reschedule_hours * HOUR_MS {
        return Err(EngineError::RescheduleBlocked {
            hours_until: hours_until(start, now),
        });
    }
    Ok(())
}

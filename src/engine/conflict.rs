use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Span of `minutes` from `start`, rejected outside the supported timestamp range.
pub(crate) fn bounded_span(start: Ms, minutes: u32) -> Result<Span, EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::starting_at(start, minutes);
    if span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(span)
}

/// Split candidate starts into `(available, booked)`. A candidate is booked when
/// `[start, start + duration)` overlaps any span in `occupied`. Order is preserved
/// and every candidate lands in exactly one list.
pub(crate) fn partition_slots(
    candidates: impl IntoIterator<Item = Ms>,
    duration_ms: Ms,
    occupied: &[Span],
) -> (Vec<Ms>, Vec<Ms>) {
    let mut available = Vec::new();
    let mut booked = Vec::new();
    for start in candidates {
        let candidate = Span::new(start, start + duration_ms);
        if occupied.iter().any(|o| o.overlaps(&candidate)) {
            booked.push(start);
        } else {
            available.push(start);
        }
    }
    (available, booked)
}

/// Commit-time check: fails with the first non-canceled appointment overlapping
/// `span`. `exclude` skips the appointment being rescheduled.
pub(crate) fn check_no_conflict(
    day: &DayLedger,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for appt in day.overlapping(span) {
        if Some(appt.id) == exclude || !appt.occupies_slot() {
            continue;
        }
        return Err(EngineError::SlotConflict(appt.id));
    }
    Ok(())
}

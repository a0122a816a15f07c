use crate::model::Ms;

pub const MAX_NOTES_LEN: usize = 1_000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_APPOINTMENTS_PER_DAY: usize = 500;
pub const MAX_HIDDEN_PER_CLIENT: usize = 10_000;

/// How far ahead slots may be listed or booked.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 366;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MIN_SLOT_GRANULARITY_MINUTES: u32 = 5;
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 12 * 60;

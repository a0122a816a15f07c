use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, Timelike, Utc};

use crate::model::{MINUTE_MS, Ms};

/// Source of "now". The engine never reads the system time directly.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// The salon's single fixed reference timezone. Dates, weekdays and minute-of-day
/// values are always read in this offset; instants are never converted for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone {
    offset: FixedOffset,
}

impl ReferenceZone {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Returns `None` for offsets beyond ±24h.
    pub fn from_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes * 60).map(Self::new)
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    fn local(&self, at: Ms) -> Option<DateTime<FixedOffset>> {
        DateTime::from_timestamp_millis(at).map(|dt| dt.with_timezone(&self.offset))
    }

    pub fn date_of(&self, at: Ms) -> Option<NaiveDate> {
        self.local(at).map(|dt| dt.date_naive())
    }

    pub fn minute_of_day(&self, at: Ms) -> Option<u32> {
        self.local(at).map(|dt| dt.time().num_seconds_from_midnight() / 60)
    }

    /// Instant of `minute` past local midnight on `date`.
    pub fn instant(&self, date: NaiveDate, minute: u32) -> Ms {
        let midnight = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        midnight - self.offset.local_minus_utc() as Ms * 1000 + minute as Ms * MINUTE_MS
    }
}

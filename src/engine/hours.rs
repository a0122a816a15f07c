use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};

use crate::model::*;

/// Date → holidays lookup. Pure, no state beyond the loaded entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidayCalendar {
    by_date: HashMap<NaiveDate, Vec<Holiday>>,
}

impl HolidayCalendar {
    pub fn new(holidays: impl IntoIterator<Item = Holiday>) -> Self {
        let mut by_date: HashMap<NaiveDate, Vec<Holiday>> = HashMap::new();
        for holiday in holidays {
            by_date.entry(holiday.date).or_default().push(holiday);
        }
        Self { by_date }
    }

    pub fn on(&self, date: NaiveDate) -> &[Holiday] {
        self.by_date.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn national(&self, date: NaiveDate) -> Option<&Holiday> {
        self.on(date).iter().find(|h| h.scope == HolidayScope::National)
    }

    pub fn regional(&self, date: NaiveDate) -> Option<&Holiday> {
        self.on(date).iter().find(|h| h.scope == HolidayScope::Regional)
    }

    pub fn len(&self) -> usize {
        self.by_date.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Holiday> {
        self.by_date.values().flatten()
    }
}

/// Resolved opening hours of one calendar date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayHours {
    pub date: NaiveDate,
    /// Sorted, non-overlapping; empty when closed.
    pub intervals: Vec<MinuteRange>,
    pub closure: Option<Closure>,
    /// Regional holiday that leaves the day open (display annotation).
    pub holiday: Option<String>,
}

impl DayHours {
    pub fn is_closed(&self) -> bool {
        self.intervals.is_empty()
    }

    /// True if `[start, start + duration)` fits inside a single open interval.
    pub fn fits(&self, start: u32, duration: u32) -> bool {
        self.intervals.iter().any(|i| i.fits(start, duration))
    }
}

/// Business Hours Resolver.
///
/// Weekly closure and national holidays close the day outright. A regional
/// holiday only annotates the day unless `regional_closes` is set; a regional
/// holiday with `closes_at` truncates the intervals at that minute.
pub fn resolve_day(
    schedule: &BusinessSchedule,
    calendar: &HolidayCalendar,
    date: NaiveDate,
    regional_closes: bool,
) -> DayHours {
    let closed = |closure| DayHours {
        date,
        intervals: Vec::new(),
        closure: Some(closure),
        holiday: None,
    };

    let weekday = schedule.for_weekday(date.weekday());
    if !weekday.open || weekday.intervals.is_empty() {
        return closed(Closure::Weekly);
    }
    if let Some(holiday) = calendar.national(date) {
        return closed(Closure::Holiday(holiday.name.clone()));
    }

    let mut intervals = weekday.intervals.clone();
    let mut annotation = None;
    if let Some(holiday) = calendar.regional(date) {
        if regional_closes {
            return closed(Closure::Holiday(holiday.name.clone()));
        }
        if let Some(cutoff) = holiday.closes_at {
            intervals = truncate_at(&intervals, cutoff);
        }
        annotation = Some(holiday.name.clone());
    }

    if intervals.is_empty() {
        return DayHours {
            date,
            intervals,
            closure: Some(Closure::Holiday(annotation.unwrap_or_default())),
            holiday: None,
        };
    }

    DayHours {
        date,
        intervals,
        closure: None,
        holiday: annotation,
    }
}

fn truncate_at(intervals: &[MinuteRange], cutoff: u32) -> Vec<MinuteRange> {
    intervals
        .iter()
        .filter(|i| i.start < cutoff)
        .map(|i| MinuteRange::new(i.start, i.end.min(cutoff)))
        .collect()
}

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use ulid::Ulid;

use crate::engine::HolidayCalendar;
use crate::limits::MAX_SERVICE_DURATION_MINUTES;
use crate::model::*;

/// On-disk shape of the reference data file.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    services: Vec<Service>,
    #[serde(default)]
    plans: Vec<SubscriptionPlan>,
    /// Absent: fall back to the configured default hours.
    #[serde(default)]
    schedule: Option<Vec<WeekdayEntry>>,
    #[serde(default)]
    holidays: Vec<Holiday>,
}

#[derive(Debug, Deserialize)]
struct WeekdayEntry {
    /// 0 = Sunday … 6 = Saturday
    weekday: u8,
    #[serde(default = "default_open")]
    open: bool,
    #[serde(default)]
    intervals: Vec<MinuteRange>,
}

fn default_open() -> bool {
    true
}

/// Immutable reference data: services, plans, weekly hours, holidays.
#[derive(Debug, Clone)]
pub struct Catalog {
    services: HashMap<Ulid, Service>,
    plans: HashMap<Ulid, SubscriptionPlan>,
    schedule: BusinessSchedule,
    calendar: HolidayCalendar,
}

impl Catalog {
    pub fn new(
        services: Vec<Service>,
        plans: Vec<SubscriptionPlan>,
        schedule: BusinessSchedule,
        holidays: Vec<Holiday>,
    ) -> Result<Self, CatalogError> {
        let mut service_map = HashMap::with_capacity(services.len());
        for service in services {
            if service.duration_minutes == 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
                return Err(CatalogError::Invalid(format!(
                    "service {} has duration {} minutes",
                    service.id, service.duration_minutes
                )));
            }
            let id = service.id;
            if service_map.insert(id, service).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate service id {id}")));
            }
        }

        let mut plan_map = HashMap::with_capacity(plans.len());
        for plan in plans {
            if let Coverage::Only(ids) = &plan.covered_services
                && let Some(unknown) = ids.iter().find(|id| !service_map.contains_key(id))
            {
                return Err(CatalogError::Invalid(format!(
                    "plan {} covers unknown service {unknown}",
                    plan.id
                )));
            }
            let id = plan.id;
            if plan_map.insert(id, plan).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate plan id {id}")));
            }
        }

        for (idx, day) in schedule.days.iter().enumerate() {
            validate_intervals(&day.intervals)
                .map_err(|reason| CatalogError::Invalid(format!("weekday {idx}: {reason}")))?;
        }
        for holiday in &holidays {
            if let Some(minute) = holiday.closes_at
                && minute > MinuteRange::DAY_END
            {
                return Err(CatalogError::Invalid(format!(
                    "holiday {} closes at minute {minute}",
                    holiday.date
                )));
            }
        }

        Ok(Self {
            services: service_map,
            plans: plan_map,
            schedule,
            calendar: HolidayCalendar::new(holidays),
        })
    }

    /// Parse and validate a catalog document. `default_schedule` is used when
    /// the document has no `schedule` section.
    pub fn from_json(text: &str, default_schedule: BusinessSchedule) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_json::from_str(text).map_err(|e| CatalogError::Parse(e.to_string()))?;

        let schedule = match file.schedule {
            None => default_schedule,
            Some(entries) => {
                let mut schedule = BusinessSchedule::default();
                let mut seen = [false; 7];
                for entry in entries {
                    let idx = entry.weekday as usize;
                    if idx > 6 {
                        return Err(CatalogError::Invalid(format!(
                            "weekday {} out of range 0..=6",
                            entry.weekday
                        )));
                    }
                    if std::mem::replace(&mut seen[idx], true) {
                        return Err(CatalogError::Invalid(format!("weekday {idx} listed twice")));
                    }
                    if entry.open && entry.intervals.is_empty() {
                        return Err(CatalogError::Invalid(format!(
                            "weekday {idx} is open without intervals"
                        )));
                    }
                    schedule.days[idx] = DaySchedule {
                        open: entry.open,
                        intervals: entry.intervals,
                    };
                }
                schedule
            }
        };

        Self::new(file.services, file.plans, schedule, file.holidays)
    }

    pub fn load(path: &Path, default_schedule: BusinessSchedule) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(CatalogError::Io)?;
        Self::from_json(&text, default_schedule)
    }

    pub fn service(&self, id: &Ulid) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn plan(&self, id: &Ulid) -> Option<&SubscriptionPlan> {
        self.plans.get(id)
    }

    pub fn schedule(&self) -> &BusinessSchedule {
        &self.schedule
    }

    pub fn holidays(&self) -> &HolidayCalendar {
        &self.calendar
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }
}

fn validate_intervals(intervals: &[MinuteRange]) -> Result<(), String> {
    let mut prev_end = 0;
    for (i, range) in intervals.iter().enumerate() {
        if range.start >= range.end || range.end > MinuteRange::DAY_END {
            return Err(format!("interval [{}, {}) is invalid", range.start, range.end));
        }
        if i > 0 && range.start < prev_end {
            return Err(format!(
                "interval [{}, {}) overlaps or is out of order",
                range.start, range.end
            ));
        }
        prev_end = range.end;
    }
    Ok(())
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "catalog read failed: {e}"),
            CatalogError::Parse(e) => write!(f, "catalog parse error: {e}"),
            CatalogError::Invalid(e) => write!(f, "invalid catalog: {e}"),
        }
    }
}

impl std::error::Error for CatalogError {}

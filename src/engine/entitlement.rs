use chrono::{Datelike, Duration, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::DenialReason;

/// Half-open date window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// Every date of the window, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }

    /// Smallest window covering both.
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// `day` of the given month, clamped to the month's last day (31 → 28 in February).
fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    (1..=day).rev().find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
}

fn add_months(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + month as i32 - 1 + delta;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

/// Rolling monthly billing cycle anchored to the day-of-month of `anchor`,
/// containing `on`. Dates before the anchor belong to the first cycle.
pub fn billing_cycle(anchor: NaiveDate, on: NaiveDate) -> Option<DateRange> {
    let day = anchor.day();
    let (year, month) = if on < anchor {
        (anchor.year(), anchor.month())
    } else {
        let here = clamped_date(on.year(), on.month(), day)?;
        if here <= on {
            (on.year(), on.month())
        } else {
            add_months(on.year(), on.month(), -1)
        }
    };
    let start = clamped_date(year, month, day)?;
    let (ny, nm) = add_months(year, month, 1);
    let end = clamped_date(ny, nm, day)?;
    Some(DateRange { start, end })
}

/// ISO week (Monday through Sunday) containing `on`.
pub fn iso_week(on: NaiveDate) -> DateRange {
    let start = on - Duration::days(on.weekday().num_days_from_monday() as i64);
    DateRange {
        start,
        end: start + Duration::days(7),
    }
}

/// Whether an appointment draws on its subscription's allowance. Usage is always
/// derived from live appointments, never stored.
pub fn consumes_entitlement(appt: &Appointment) -> bool {
    if appt.origin != Origin::Subscription {
        return false;
    }
    match appt.status {
        AppointmentStatus::Pending
        | AppointmentStatus::Confirmed
        | AppointmentStatus::Completed
        | AppointmentStatus::NoShow => true,
        AppointmentStatus::Canceled => appt.cancellation.as_ref().is_some_and(|c| c.penalized),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub monthly: u32,
    pub weekly: u32,
    pub facial: u32,
}

/// Count the subscription's consumed sessions inside `cycle` and `week`.
/// `dated` pairs every appointment with its reference-zone date.
pub fn count_usage<'a>(
    dated: impl IntoIterator<Item = (NaiveDate, &'a Appointment)>,
    subscription_id: Ulid,
    cycle: &DateRange,
    week: &DateRange,
    is_facial: impl Fn(&Ulid) -> bool,
    exclude: Option<Ulid>,
) -> Usage {
    let mut usage = Usage::default();
    for (date, appt) in dated {
        if appt.subscription_id != Some(subscription_id)
            || Some(appt.id) == exclude
            || !consumes_entitlement(appt)
        {
            continue;
        }
        if cycle.contains(date) {
            usage.monthly += 1;
            if is_facial(&appt.service_id) {
                usage.facial += 1;
            }
        }
        if week.contains(date) {
            usage.weekly += 1;
        }
    }
    usage
}

/// Authorization order: status, coverage, monthly, weekly, facial.
pub fn authorize(
    subscription: &Subscription,
    plan: &SubscriptionPlan,
    service: &Service,
    usage: &Usage,
) -> Result<(), DenialReason> {
    if subscription.status != SubscriptionStatus::Active {
        return Err(DenialReason::PlanInactive);
    }
    if !service.plan_coverable || !plan.covered_services.covers(&service.id) {
        return Err(DenialReason::ServiceNotCovered);
    }
    if usage.monthly >= plan.max_treatments_per_month {
        return Err(DenialReason::MonthlyLimitReached);
    }
    if let Some(weekly) = plan.max_treatments_per_week
        && usage.weekly >= weekly
    {
        return Err(DenialReason::WeeklyLimitReached);
    }
    if service.category == ServiceCategory::Facial
        && let Some(facial) = plan.max_facial_per_month
        && usage.facial >= facial
    {
        return Err(DenialReason::FacialLimitReached);
    }
    Ok(())
}

/// Allowance left, clamped at zero; nothing is left on an inactive subscription.
pub fn remaining(subscription: &Subscription, plan: &SubscriptionPlan, usage: &Usage) -> Remaining {
    if subscription.status != SubscriptionStatus::Active {
        return Remaining {
            monthly: 0,
            weekly: plan.max_treatments_per_week.map(|_| 0),
        };
    }
    Remaining {
        monthly: plan.max_treatments_per_month.saturating_sub(usage.monthly),
        weekly: plan
            .max_treatments_per_week
            .map(|limit| limit.saturating_sub(usage.weekly)),
    }
}

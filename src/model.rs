use std::collections::HashSet;

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span of `minutes` beginning at `start`.
    pub fn starting_at(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + minutes as Ms * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Minute-of-day range `[start, end)`, 0..=1440.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteRange {
    pub start: u32,
    pub end: u32,
}

impl MinuteRange {
    pub const DAY_END: u32 = 24 * 60;

    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start < end, "MinuteRange start must be before end");
        Self { start, end }
    }

    /// True if `[start, start + duration)` lies entirely inside this range.
    pub fn fits(&self, start: u32, duration: u32) -> bool {
        self.start <= start && start + duration <= self.end
    }
}

// ── Reference data ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    Facial,
    Body,
    Massage,
    Hair,
    Nails,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: i64,
    pub category: ServiceCategory,
    /// Whether a subscription plan may cover this service at all.
    pub plan_coverable: bool,
}

/// Opening hours of one weekday. A lunch break is the gap between two intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub open: bool,
    pub intervals: Vec<MinuteRange>,
}

/// Weekly opening hours, indexed by days from Sunday (0 = Sunday … 6 = Saturday).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusinessSchedule {
    pub days: [DaySchedule; 7],
}

impl BusinessSchedule {
    /// Monday–Saturday open over a single `[open, close)` range, Sunday closed.
    pub fn uniform(open: u32, close: u32) -> Self {
        let mut schedule = Self::default();
        for (idx, day) in schedule.days.iter_mut().enumerate() {
            if idx != 0 {
                *day = DaySchedule {
                    open: true,
                    intervals: vec![MinuteRange::new(open, close)],
                };
            }
        }
        schedule
    }

    pub fn for_weekday(&self, weekday: Weekday) -> &DaySchedule {
        &self.days[weekday.num_days_from_sunday() as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolidayScope {
    National,
    Regional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub date: NaiveDate,
    pub name: String,
    pub scope: HolidayScope,
    /// Early closing (minute of day) for a shortened regional holiday.
    #[serde(default)]
    pub closes_at: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    All,
    Only(HashSet<Ulid>),
}

impl Coverage {
    pub fn covers(&self, service_id: &Ulid) -> bool {
        match self {
            Coverage::All => true,
            Coverage::Only(ids) => ids.contains(service_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Ulid,
    pub name: String,
    pub tier: String,
    pub price_cents: i64,
    pub max_treatments_per_month: u32,
    #[serde(default)]
    pub max_treatments_per_week: Option<u32>,
    #[serde(default)]
    pub max_facial_per_month: Option<u32>,
    pub covered_services: Coverage,
}

// ── Appointments ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Canceled,
    NoShow,
}

impl AppointmentStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Canceled => "canceled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Commercial pathway an appointment was booked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    Subscription,
    Single,
    Voucher,
    AdminCreated,
}

impl Origin {
    pub fn label(&self) -> &'static str {
        match self {
            Origin::Subscription => "subscription",
            Origin::Single => "single",
            Origin::Voucher => "voucher",
            Origin::AdminCreated => "admin_created",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    None,
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PaymentStatus::None => "none",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
        }
    }
}

/// Opaque result reported back by the payment processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Client,
    Staff,
    System,
}

impl Actor {
    pub fn label(&self) -> &'static str {
        match self {
            Actor::Client => "client",
            Actor::Staff => "staff",
            Actor::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub actor: Actor,
    pub reason: Option<String>,
    /// Inside the minimum-notice window: a covered session stays consumed.
    pub penalized: bool,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub service_id: Ulid,
    /// Set for plan-covered bookings: the subscription whose allowance they draw on.
    pub subscription_id: Option<Ulid>,
    pub span: Span,
    pub status: AppointmentStatus,
    pub origin: Origin,
    pub payment: PaymentStatus,
    pub notes: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub created_at: Ms,
}

impl Appointment {
    /// Everything except a cancellation keeps its window occupied.
    pub fn occupies_slot(&self) -> bool {
        self.status != AppointmentStatus::Canceled
    }
}

/// All appointments whose start falls on one reference-zone date, canceled ones
/// included (they keep their history but no longer occupy the slot).
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub date: NaiveDate,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl DayLedger {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appt.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appt);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments whose span overlaps `query`, canceled ones included.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Spans currently holding their slot.
    pub fn occupied(&self) -> impl Iterator<Item = &Span> {
        self.appointments
            .iter()
            .filter(|a| a.occupies_slot())
            .map(|a| &a.span)
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }
}

// ── Subscriptions ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Ulid,
    pub client_id: Ulid,
    pub plan_id: Ulid,
    pub status: SubscriptionStatus,
    /// Anchor of the rolling monthly billing cycle.
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    /// Cancellation is refused before this date.
    pub commitment_end: Option<NaiveDate>,
}

/// Journal record. Snapshot variants (`AppointmentBooked`, `SubscriptionStarted`)
/// carry the whole entity so compaction can rewrite current state directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentBooked(Appointment),
    AppointmentStatusChanged {
        id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentCanceled {
        id: Ulid,
        cancellation: Cancellation,
    },
    AppointmentRescheduled {
        id: Ulid,
        span: Span,
    },
    PaymentRecorded {
        id: Ulid,
        payment: PaymentStatus,
        status: AppointmentStatus,
        cancellation: Option<Cancellation>,
    },
    HistoryHidden {
        client_id: Ulid,
        appointment_id: Ulid,
    },
    SubscriptionStarted(Subscription),
    SubscriptionPlanChanged {
        id: Ulid,
        plan_id: Ulid,
    },
    SubscriptionStatusChanged {
        id: Ulid,
        status: SubscriptionStatus,
        end_date: Option<NaiveDate>,
    },
}

impl Event {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AppointmentBooked(_) => "appointment_booked",
            Event::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Event::AppointmentCanceled { .. } => "appointment_canceled",
            Event::AppointmentRescheduled { .. } => "appointment_rescheduled",
            Event::PaymentRecorded { .. } => "payment_recorded",
            Event::HistoryHidden { .. } => "history_hidden",
            Event::SubscriptionStarted(_) => "subscription_started",
            Event::SubscriptionPlanChanged { .. } => "subscription_plan_changed",
            Event::SubscriptionStatusChanged { .. } => "subscription_status_changed",
        }
    }
}

// ── Query result types ──────────────────────────────────────────

/// Why a date offers no slots at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    Weekly,
    Holiday(String),
}

/// Slot listing for one (date, service): occupied slots are returned, not hidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBoard {
    pub date: NaiveDate,
    pub service_id: Ulid,
    pub closure: Option<Closure>,
    /// Name of a non-closing regional holiday on this date.
    pub holiday: Option<String>,
    pub available: Vec<Ms>,
    pub booked: Vec<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remaining {
    pub monthly: u32,
    pub weekly: Option<u32>,
}

mod conflict;
mod entitlement;
mod error;
mod hours;
mod lifecycle;
mod mutations;
mod policy;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use entitlement::{DateRange, Usage, billing_cycle, iso_week};
pub use error::{DenialReason, EngineError};
pub use hours::{DayHours, HolidayCalendar, resolve_day};
pub use slots::SlotGrid;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::config::SystemConfig;
use crate::journal::{Journal, JournalHandle};
use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedDay = Arc<RwLock<DayLedger>>;
pub type SharedSubscription = Arc<RwLock<Subscription>>;
pub type SharedHidden = Arc<RwLock<HashSet<Ulid>>>;

/// A concurrent reschedule can move an appointment between ledgers while we
/// wait for a lock; give up after this many re-resolutions.
const MAX_RESOLVE_ATTEMPTS: usize = 8;

/// The scheduling core. Appointments live in per-date ledgers; every write to a
/// date holds that ledger's write lock across check, journal append and apply,
/// so two bookings for overlapping windows can never both commit.
pub struct Engine {
    days: DashMap<NaiveDate, SharedDay>,
    /// Reverse lookup: appointment id → ledger date.
    appointment_day: DashMap<Ulid, NaiveDate>,
    client_appointments: DashMap<Ulid, Vec<Ulid>>,
    subscriptions: DashMap<Ulid, SharedSubscription>,
    /// Client → subscription ids in start order. Only the last may be non-canceled.
    client_subscriptions: DashMap<Ulid, Vec<Ulid>>,
    /// Serializes subscription starts so a client never ends up with two live ones.
    subscription_gate: Mutex<()>,
    hidden: DashMap<Ulid, SharedHidden>,
    journal: JournalHandle,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    catalog: Arc<Catalog>,
    config: SystemConfig,
}

/// Apply a single-ledger event (no locking, caller holds the ledger lock).
/// Cross-date reschedules go through `move_appointment` instead.
fn apply_to_day(day: &mut DayLedger, event: &Event) {
    match event {
        Event::AppointmentBooked(appt) => day.insert(appt.clone()),
        Event::AppointmentStatusChanged { id, status } => {
            if let Some(appt) = day.get_mut(id) {
                appt.status = *status;
            }
        }
        Event::AppointmentCanceled { id, cancellation } => {
            if let Some(appt) = day.get_mut(id) {
                appt.status = AppointmentStatus::Canceled;
                appt.cancellation = Some(cancellation.clone());
            }
        }
        Event::AppointmentRescheduled { id, span } => {
            if let Some(mut appt) = day.remove(*id) {
                appt.span = *span;
                day.insert(appt);
            }
        }
        Event::PaymentRecorded {
            id,
            payment,
            status,
            cancellation,
        } => {
            if let Some(appt) = day.get_mut(id) {
                appt.payment = *payment;
                appt.status = *status;
                if cancellation.is_some() {
                    appt.cancellation = cancellation.clone();
                }
            }
        }
        Event::HistoryHidden { .. }
        | Event::SubscriptionStarted(_)
        | Event::SubscriptionPlanChanged { .. }
        | Event::SubscriptionStatusChanged { .. } => {}
    }
}

fn move_appointment(from: &mut DayLedger, to: &mut DayLedger, id: Ulid, span: Span) -> Option<Appointment> {
    let mut appt = from.remove(id)?;
    appt.span = span;
    to.insert(appt.clone());
    Some(appt)
}

fn apply_to_subscription(sub: &mut Subscription, event: &Event) {
    match event {
        Event::SubscriptionPlanChanged { plan_id, .. } => sub.plan_id = *plan_id,
        Event::SubscriptionStatusChanged {
            status, end_date, ..
        } => {
            sub.status = *status;
            sub.end_date = *end_date;
        }
        _ => {}
    }
}

impl Engine {
    /// Replay the journal at `journal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(
        journal_path: PathBuf,
        catalog: Arc<Catalog>,
        config: SystemConfig,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;

        let engine = Self {
            days: DashMap::new(),
            appointment_day: DashMap::new(),
            client_appointments: DashMap::new(),
            subscriptions: DashMap::new(),
            client_subscriptions: DashMap::new(),
            subscription_gate: Mutex::new(()),
            hidden: DashMap::new(),
            journal: JournalHandle::spawn(journal),
            notify,
            clock,
            catalog,
            config,
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // blocking_write would panic inside the runtime.
        for event in &events {
            if let Err(reason) = engine.replay_event(event) {
                warn!(kind = event.kind(), "skipping journal record: {reason}");
            }
        }
        info!(
            events = events.len(),
            appointments = engine.appointment_day.len(),
            subscriptions = engine.subscriptions.len(),
            "journal replayed"
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> Result<(), String> {
        match event {
            Event::AppointmentBooked(appt) => {
                let date = self.ledger_date(appt.span.start).map_err(|e| e.to_string())?;
                // A compacted journal can book the same id again on another date;
                // the later record wins.
                if let Some(previous) = self.current_date(&appt.id)
                    && previous != date
                {
                    let old_day = self.day(previous);
                    let mut old_guard = old_day.try_write().map_err(|e| e.to_string())?;
                    old_guard.remove(appt.id);
                }
                let day = self.day(date);
                let mut guard = day.try_write().map_err(|e| e.to_string())?;
                guard.remove(appt.id);
                apply_to_day(&mut guard, event);
                self.index_booked(appt, date);
            }
            Event::AppointmentRescheduled { id, span } => {
                let from = self.current_date(id).ok_or("unknown appointment")?;
                let to = self.ledger_date(span.start).map_err(|e| e.to_string())?;
                if from == to {
                    let day = self.day(from);
                    let mut guard = day.try_write().map_err(|e| e.to_string())?;
                    apply_to_day(&mut guard, event);
                } else {
                    let (from_day, to_day) = (self.day(from), self.day(to));
                    let mut from_guard = from_day.try_write().map_err(|e| e.to_string())?;
                    let mut to_guard = to_day.try_write().map_err(|e| e.to_string())?;
                    move_appointment(&mut from_guard, &mut to_guard, *id, *span)
                        .ok_or("appointment missing from its ledger")?;
                    self.appointment_day.insert(*id, to);
                }
            }
            Event::AppointmentStatusChanged { id, .. }
            | Event::AppointmentCanceled { id, .. }
            | Event::PaymentRecorded { id, .. } => {
                let date = self.current_date(id).ok_or("unknown appointment")?;
                let day = self.day(date);
                let mut guard = day.try_write().map_err(|e| e.to_string())?;
                apply_to_day(&mut guard, event);
            }
            Event::HistoryHidden {
                client_id,
                appointment_id,
            } => {
                let hidden = self.hidden_set(*client_id);
                let mut guard = hidden.try_write().map_err(|e| e.to_string())?;
                guard.insert(*appointment_id);
            }
            Event::SubscriptionStarted(sub) => self.index_subscription(sub.clone()),
            Event::SubscriptionPlanChanged { id, .. } | Event::SubscriptionStatusChanged { id, .. } => {
                let sub = self.get_subscription(id).ok_or("unknown subscription")?;
                let mut guard = sub.try_write().map_err(|e| e.to_string())?;
                apply_to_subscription(&mut guard, event);
            }
        }
        Ok(())
    }

    fn index_booked(&self, appt: &Appointment, date: NaiveDate) {
        if self.appointment_day.insert(appt.id, date).is_none() {
            self.client_appointments
                .entry(appt.client_id)
                .or_default()
                .push(appt.id);
        }
    }

    fn index_subscription(&self, sub: Subscription) {
        let (id, client_id) = (sub.id, sub.client_id);
        if self
            .subscriptions
            .insert(id, Arc::new(RwLock::new(sub)))
            .is_none()
        {
            self.client_subscriptions.entry(client_id).or_default().push(id);
        }
    }

    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.journal
            .append(event)
            .await
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    /// Journal-append + apply + notify for an event confined to one ledger.
    pub(super) async fn persist_and_apply_day(
        &self,
        day: &mut DayLedger,
        client_id: Ulid,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_day(day, event);
        if let Event::AppointmentBooked(appt) = event {
            self.index_booked(appt, day.date);
        }
        self.notify.send(client_id, event);
        Ok(())
    }

    pub(super) async fn persist_and_apply_subscription(
        &self,
        sub: &mut Subscription,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_subscription(sub, event);
        self.notify.send(sub.client_id, event);
        Ok(())
    }

    // ── Lookups ──────────────────────────────────────────────

    /// Ledger for `date`, created empty on first use.
    pub(super) fn day(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(date))))
            .clone()
    }

    pub(super) fn existing_day(&self, date: NaiveDate) -> Option<SharedDay> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    pub(super) fn current_date(&self, appointment_id: &Ulid) -> Option<NaiveDate> {
        self.appointment_day.get(appointment_id).map(|e| *e.value())
    }

    pub(super) fn get_subscription(&self, id: &Ulid) -> Option<SharedSubscription> {
        self.subscriptions.get(id).map(|e| e.value().clone())
    }

    /// The client's most recent subscription, which is the only one that can be live.
    pub(super) fn latest_subscription(&self, client_id: &Ulid) -> Option<SharedSubscription> {
        let id = self
            .client_subscriptions
            .get(client_id)
            .and_then(|ids| ids.last().copied())?;
        self.get_subscription(&id)
    }

    pub(super) fn hidden_set(&self, client_id: Ulid) -> SharedHidden {
        self.hidden.entry(client_id).or_default().clone()
    }

    pub(super) fn ledger_date(&self, at: Ms) -> Result<NaiveDate, EngineError> {
        self.config
            .zone
            .date_of(at)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))
    }

    pub(super) fn today(&self) -> Result<NaiveDate, EngineError> {
        self.ledger_date(self.clock.now_ms())
    }

    pub(super) fn hours_on(&self, date: NaiveDate) -> DayHours {
        resolve_day(
            self.catalog.schedule(),
            self.catalog.holidays(),
            date,
            self.config.regional_holidays_close,
        )
    }

    pub(super) fn service(&self, id: &Ulid) -> Result<&Service, EngineError> {
        self.catalog.service(id).ok_or(EngineError::NotFound(*id))
    }

    /// A subscription pointing at a plan the catalog no longer has.
    pub(super) fn plan_of(&self, sub: &Subscription) -> Result<&SubscriptionPlan, EngineError> {
        self.catalog.plan(&sub.plan_id).ok_or_else(|| {
            tracing::error!(subscription = %sub.id, plan = %sub.plan_id, "subscription references unknown plan");
            EngineError::Integrity(format!("plan {} missing from catalog", sub.plan_id))
        })
    }

    pub(super) fn is_facial(&self, service_id: &Ulid) -> bool {
        self.catalog
            .service(service_id)
            .is_some_and(|s| s.category == ServiceCategory::Facial)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Lock the ledger holding `id`. Re-resolves if a concurrent reschedule
    /// moved the appointment while we waited.
    pub(super) async fn resolve_appointment_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DayLedger>, EngineError> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let date = self.current_date(id).ok_or(EngineError::NotFound(*id))?;
            let day = self.existing_day(date).ok_or(EngineError::NotFound(*id))?;
            let guard = day.write_owned().await;
            if guard.get(id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::Integrity(format!(
            "appointment {id} kept moving between ledgers"
        )))
    }

    /// Lock several ledgers in ascending date order.
    pub(super) async fn lock_days(
        &self,
        dates: &[NaiveDate],
    ) -> Vec<(NaiveDate, OwnedRwLockWriteGuard<DayLedger>)> {
        let mut sorted = dates.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for date in sorted {
            guards.push((date, self.day(date).write_owned().await));
        }
        guards
    }
}

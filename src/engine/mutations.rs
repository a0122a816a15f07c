use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    APPOINTMENTS_CREATED_TOTAL, CANCELLATIONS_TOTAL, ENTITLEMENT_DENIALS_TOTAL,
    JOURNAL_COMPACTIONS_TOTAL, RESCHEDULES_BLOCKED_TOTAL, SLOT_CONFLICTS_TOTAL,
};

use super::conflict::{bounded_span, check_no_conflict};
use super::entitlement::{Usage, authorize, billing_cycle, count_usage, iso_week};
use super::lifecycle::{check_transition, initial_payment, initial_status, is_terminal};
use super::policy::{cancellation_penalized, check_reschedule};
use super::{
    DayHours, DenialReason, Engine, EngineError, MAX_RESOLVE_ATTEMPTS, SlotGrid, move_appointment,
};

fn note_conflict(err: EngineError) -> EngineError {
    if let EngineError::SlotConflict(holder) = &err {
        metrics::counter!(SLOT_CONFLICTS_TOTAL).increment(1);
        debug!(%holder, "slot taken");
    }
    err
}

impl Engine {
    /// Book `service_id` for `client_id` starting at `start`.
    ///
    /// The slot check and the insert happen under the date's write lock, so of
    /// two racing requests for overlapping windows exactly one commits and the
    /// other sees `SlotConflict`. Plan-covered bookings additionally hold the
    /// subscription's write lock while usage is counted.
    pub async fn create_appointment(
        &self,
        id: Ulid,
        client_id: Ulid,
        service_id: Ulid,
        start: Ms,
        origin: Origin,
        notes: Option<String>,
    ) -> Result<Appointment, EngineError> {
        if let Some(ref n) = notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if self.appointment_day.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let service = self.service(&service_id)?;
        let span = bounded_span(start, service.duration_minutes)?;
        let date = self.ledger_date(start)?;
        let now = self.clock.now_ms();
        let hours = self.hours_on(date);
        if hours.is_closed() {
            return Err(EngineError::ClosedDay(date));
        }
        self.check_bookable(&hours, start, service, origin, now)?;

        let sub_guard = if origin == Origin::Subscription {
            let sub = self
                .latest_subscription(&client_id)
                .ok_or(EngineError::EntitlementDenied(DenialReason::PlanInactive))?;
            let guard = sub.write_owned().await;
            self.authorize_booking(&guard, service, date, None).await?;
            Some(guard)
        } else {
            None
        };
        let subscription_id = sub_guard.as_ref().map(|g| g.id);

        let day = self.day(date);
        let mut guard = day.write().await;
        if guard.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this date"));
        }
        check_no_conflict(&guard, &span, None).map_err(note_conflict)?;
        if self.appointment_day.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let appt = Appointment {
            id,
            client_id,
            service_id,
            subscription_id,
            span,
            status: initial_status(origin),
            origin,
            payment: initial_payment(origin),
            notes,
            cancellation: None,
            created_at: now,
        };
        let event = Event::AppointmentBooked(appt.clone());
        self.persist_and_apply_day(&mut guard, client_id, &event).await?;
        drop(sub_guard);

        metrics::counter!(APPOINTMENTS_CREATED_TOTAL, "origin" => origin.label()).increment(1);
        info!(%id, %client_id, %service_id, %date, origin = origin.label(), "appointment booked");
        Ok(appt)
    }

    /// Cancel an active appointment. Always permitted; a cancellation inside
    /// the notice window is penalized and a covered session stays used.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let mut guard = self.resolve_appointment_write(&id).await?;
        let appt = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        check_transition(appt.status, AppointmentStatus::Canceled)?;

        let now = self.clock.now_ms();
        let penalized = cancellation_penalized(&self.config, appt.span.start, now);
        let client_id = appt.client_id;
        let event = Event::AppointmentCanceled {
            id,
            cancellation: Cancellation {
                actor,
                reason,
                penalized,
                at: now,
            },
        };
        self.persist_and_apply_day(&mut guard, client_id, &event).await?;

        metrics::counter!(
            CANCELLATIONS_TOTAL,
            "actor" => actor.label(),
            "penalized" => if penalized { "true" } else { "false" }
        )
        .increment(1);
        info!(%id, actor = actor.label(), penalized, "appointment canceled");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Staff-driven status change: confirm, complete or mark a no-show.
    /// A transition to `Canceled` is a staff cancellation.
    pub async fn transition_appointment(
        &self,
        id: Ulid,
        to: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        if to == AppointmentStatus::Canceled {
            return self.cancel_appointment(id, Actor::Staff, None).await;
        }
        let mut guard = self.resolve_appointment_write(&id).await?;
        let appt = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        let from = appt.status;
        check_transition(from, to)?;
        let client_id = appt.client_id;

        let event = Event::AppointmentStatusChanged { id, status: to };
        self.persist_and_apply_day(&mut guard, client_id, &event).await?;
        info!(%id, %from, %to, "appointment status changed");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn confirm_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition_appointment(id, AppointmentStatus::Confirmed).await
    }

    pub async fn complete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition_appointment(id, AppointmentStatus::Completed).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition_appointment(id, AppointmentStatus::NoShow).await
    }

    /// Move an appointment to `new_start`. Refused inside the notice window.
    /// The new slot is validated like a fresh booking of the same origin; on any
    /// failure the original appointment is left untouched.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        new_start: Ms,
    ) -> Result<Appointment, EngineError> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let old_date = self.current_date(&id).ok_or(EngineError::NotFound(id))?;
            let snapshot = {
                let day = self.existing_day(old_date).ok_or(EngineError::NotFound(id))?;
                let guard = day.read().await;
                match guard.get(&id) {
                    Some(appt) => appt.clone(),
                    None => continue,
                }
            };
            if is_terminal(snapshot.status) {
                return Err(EngineError::AlreadyTerminal(snapshot.status));
            }
            let now = self.clock.now_ms();
            if let Err(e) = check_reschedule(&self.config, snapshot.span.start, now) {
                metrics::counter!(RESCHEDULES_BLOCKED_TOTAL).increment(1);
                return Err(e);
            }

            let service = self.catalog.service(&snapshot.service_id).ok_or_else(|| {
                EngineError::Integrity(format!("service {} missing from catalog", snapshot.service_id))
            })?;
            let span = bounded_span(new_start, service.duration_minutes)?;
            let new_date = self.ledger_date(new_start)?;
            let hours = self.hours_on(new_date);
            if hours.is_closed() {
                return Err(EngineError::ClosedDay(new_date));
            }
            self.check_bookable(&hours, new_start, service, snapshot.origin, now)?;

            let sub_guard = match snapshot.subscription_id {
                Some(sub_id) => {
                    let sub = self.get_subscription(&sub_id).ok_or_else(|| {
                        EngineError::Integrity(format!("subscription {sub_id} missing"))
                    })?;
                    let guard = sub.write_owned().await;
                    self.authorize_booking(&guard, service, new_date, Some(id))
                        .await?;
                    Some(guard)
                }
                None => None,
            };

            let mut guards = self.lock_days(&[old_date, new_date]).await;
            let old_idx = guards.iter().position(|(d, _)| *d == old_date);
            let new_idx = guards.iter().position(|(d, _)| *d == new_date);
            let (Some(old_idx), Some(new_idx)) = (old_idx, new_idx) else {
                return Err(EngineError::Integrity("ledger lock set incomplete".into()));
            };
            if guards[old_idx].1.get(&id) != Some(&snapshot) {
                // Changed while unlocked; start over.
                continue;
            }
            if old_idx != new_idx && guards[new_idx].1.len() >= MAX_APPOINTMENTS_PER_DAY {
                return Err(EngineError::LimitExceeded("too many appointments on this date"));
            }
            check_no_conflict(&guards[new_idx].1, &span, Some(id)).map_err(note_conflict)?;

            let event = Event::AppointmentRescheduled { id, span };
            self.journal_append(&event).await?;
            let moved = if old_idx == new_idx {
                super::apply_to_day(&mut guards[old_idx].1, &event);
                guards[old_idx].1.get(&id).cloned()
            } else {
                let (lo, hi) = guards.split_at_mut(1);
                let (from, to) = if old_idx == 0 {
                    (&mut lo[0].1, &mut hi[0].1)
                } else {
                    (&mut hi[0].1, &mut lo[0].1)
                };
                let moved = move_appointment(from, to, id, span);
                self.appointment_day.insert(id, new_date);
                moved
            };
            self.notify.send(snapshot.client_id, &event);
            drop(sub_guard);

            info!(%id, from = snapshot.span.start, to = new_start, "appointment rescheduled");
            return moved.ok_or(EngineError::NotFound(id));
        }
        Err(EngineError::Integrity(format!(
            "appointment {id} kept changing during reschedule"
        )))
    }

    /// Apply an opaque payment-processor result. Success marks the appointment
    /// paid and confirms a pending one; a canceled appointment is left as is.
    /// Failure cancels a pending single
    /// booking on the system's behalf and changes nothing otherwise.
    pub async fn record_payment(
        &self,
        id: Ulid,
        outcome: PaymentOutcome,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let appt = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        let now = self.clock.now_ms();

        let event = match outcome {
            PaymentOutcome::Succeeded => {
                if appt.payment == PaymentStatus::Paid {
                    return Ok(appt.clone());
                }
                if appt.status == AppointmentStatus::Canceled {
                    // Refunds are the processor's business; the record stays as canceled.
                    warn!(%id, "payment succeeded for a canceled appointment, ignored");
                    return Ok(appt.clone());
                }
                let status = if appt.status == AppointmentStatus::Pending {
                    AppointmentStatus::Confirmed
                } else {
                    appt.status
                };
                Event::PaymentRecorded {
                    id,
                    payment: PaymentStatus::Paid,
                    status,
                    cancellation: None,
                }
            }
            PaymentOutcome::Failed => {
                if appt.origin != Origin::Single || appt.status != AppointmentStatus::Pending {
                    debug!(%id, status = %appt.status, "payment failure ignored");
                    return Ok(appt.clone());
                }
                Event::PaymentRecorded {
                    id,
                    payment: appt.payment,
                    status: AppointmentStatus::Canceled,
                    cancellation: Some(Cancellation {
                        actor: Actor::System,
                        reason: Some("payment failed".into()),
                        penalized: false,
                        at: now,
                    }),
                }
            }
        };
        let client_id = appt.client_id;
        self.persist_and_apply_day(&mut guard, client_id, &event).await?;
        if outcome == PaymentOutcome::Failed {
            metrics::counter!(CANCELLATIONS_TOTAL, "actor" => "system", "penalized" => "false")
                .increment(1);
        }
        info!(%id, outcome = ?outcome, "payment recorded");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Hide a past appointment from the client's own history view. The record
    /// itself is kept. Idempotent.
    pub async fn hide_from_history(
        &self,
        client_id: Ulid,
        appointment_id: Ulid,
    ) -> Result<(), EngineError> {
        let date = self
            .current_date(&appointment_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        let owner = {
            let day = self
                .existing_day(date)
                .ok_or(EngineError::NotFound(appointment_id))?;
            let guard = day.read().await;
            guard
                .get(&appointment_id)
                .map(|a| a.client_id)
                .ok_or(EngineError::NotFound(appointment_id))?
        };
        if owner != client_id {
            return Err(EngineError::NotOwner(appointment_id));
        }

        let hidden = self.hidden_set(client_id);
        let mut guard = hidden.write().await;
        if guard.contains(&appointment_id) {
            return Ok(());
        }
        if guard.len() >= MAX_HIDDEN_PER_CLIENT {
            return Err(EngineError::LimitExceeded("too many hidden appointments"));
        }
        let event = Event::HistoryHidden {
            client_id,
            appointment_id,
        };
        self.journal_append(&event).await?;
        guard.insert(appointment_id);
        self.notify.send(client_id, &event);
        debug!(%client_id, %appointment_id, "hidden from history");
        Ok(())
    }

    // ── Subscriptions ────────────────────────────────────────

    pub async fn subscribe(
        &self,
        id: Ulid,
        client_id: Ulid,
        plan_id: Ulid,
        start_date: NaiveDate,
        commitment_end: Option<NaiveDate>,
    ) -> Result<Subscription, EngineError> {
        if self.catalog.plan(&plan_id).is_none() {
            return Err(EngineError::NotFound(plan_id));
        }
        if commitment_end.is_some_and(|end| end < start_date) {
            return Err(EngineError::LimitExceeded("commitment ends before the subscription starts"));
        }

        let _gate = self.subscription_gate.lock().await;
        if self.subscriptions.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(current) = self.latest_subscription(&client_id) {
            let current = current.read().await;
            if current.status != SubscriptionStatus::Canceled {
                return Err(EngineError::AlreadyExists(current.id));
            }
        }

        let sub = Subscription {
            id,
            client_id,
            plan_id,
            status: SubscriptionStatus::Active,
            start_date,
            end_date: None,
            commitment_end,
        };
        let event = Event::SubscriptionStarted(sub.clone());
        self.journal_append(&event).await?;
        self.index_subscription(sub.clone());
        self.notify.send(client_id, &event);
        info!(%id, %client_id, %plan_id, %start_date, "subscription started");
        Ok(sub)
    }

    /// Switch plans. Takes effect for every booking authorized afterwards; the
    /// cycle anchor stays put.
    pub async fn change_plan(&self, id: Ulid, plan_id: Ulid) -> Result<Subscription, EngineError> {
        if self.catalog.plan(&plan_id).is_none() {
            return Err(EngineError::NotFound(plan_id));
        }
        let sub = self.get_subscription(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = sub.write().await;
        if guard.status != SubscriptionStatus::Active {
            return Err(EngineError::SubscriptionInactive(id));
        }
        if guard.plan_id == plan_id {
            return Ok(guard.clone());
        }
        let from = guard.plan_id;
        let event = Event::SubscriptionPlanChanged { id, plan_id };
        self.persist_and_apply_subscription(&mut guard, &event).await?;
        info!(%id, %from, to = %plan_id, "subscription plan changed");
        Ok(guard.clone())
    }

    /// Billing-driven status flips between `Active` and `PastDue`. Ending a
    /// subscription goes through `cancel_subscription`.
    pub async fn set_subscription_status(
        &self,
        id: Ulid,
        status: SubscriptionStatus,
    ) -> Result<Subscription, EngineError> {
        if status == SubscriptionStatus::Canceled {
            return self.cancel_subscription(id).await;
        }
        let sub = self.get_subscription(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = sub.write().await;
        if guard.status == SubscriptionStatus::Canceled {
            return Err(EngineError::SubscriptionInactive(id));
        }
        if guard.status == status {
            return Ok(guard.clone());
        }
        let event = Event::SubscriptionStatusChanged {
            id,
            status,
            end_date: None,
        };
        self.persist_and_apply_subscription(&mut guard, &event).await?;
        info!(%id, status = status.label(), "subscription status changed");
        Ok(guard.clone())
    }

    /// End a subscription today. Refused while the commitment period runs.
    pub async fn cancel_subscription(&self, id: Ulid) -> Result<Subscription, EngineError> {
        let sub = self.get_subscription(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = sub.write().await;
        if guard.status == SubscriptionStatus::Canceled {
            return Err(EngineError::SubscriptionInactive(id));
        }
        let today = self.today()?;
        if let Some(end) = guard.commitment_end
            && today < end
        {
            return Err(EngineError::CommitmentActive(end));
        }
        let event = Event::SubscriptionStatusChanged {
            id,
            status: SubscriptionStatus::Canceled,
            end_date: Some(today),
        };
        self.persist_and_apply_subscription(&mut guard, &event).await?;
        info!(%id, end_date = %today, "subscription canceled");
        Ok(guard.clone())
    }

    // ── Journal maintenance ──────────────────────────────────

    /// Rewrite the journal as one snapshot record per live entity. Events that
    /// commit while the snapshot is taken are kept behind it.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        self.journal
            .begin_compaction()
            .await
            .map_err(|e| EngineError::JournalError(e.to_string()))?;

        // Per-client start order decides which subscription replays as the latest.
        let sub_ids: Vec<Ulid> = self
            .client_subscriptions
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        let subs: Vec<_> = sub_ids
            .iter()
            .filter_map(|id| self.get_subscription(id))
            .collect();
        let hidden: Vec<_> = self
            .hidden
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut events = Vec::with_capacity(subs.len());
        for sub in subs {
            events.push(Event::SubscriptionStarted(sub.read().await.clone()));
        }
        match self.snapshot_days().await {
            Some(booked) => events.extend(booked),
            None => {
                self.journal.abort_compaction().await;
                return Err(EngineError::Integrity(
                    "ledgers kept changing during compaction".into(),
                ));
            }
        }
        for (client_id, set) in hidden {
            let guard = set.read().await;
            events.extend(guard.iter().map(|appointment_id| Event::HistoryHidden {
                client_id,
                appointment_id: *appointment_id,
            }));
        }

        let count = events.len();
        if let Err(e) = self.journal.compact(events).await {
            warn!("journal compaction failed: {e}");
            self.journal.abort_compaction().await;
            return Err(EngineError::JournalError(e.to_string()));
        }
        metrics::counter!(JOURNAL_COMPACTIONS_TOTAL).increment(1);
        info!(records = count, "journal compacted");
        Ok(())
    }

    /// One booking record per appointment, read with every ledger locked at
    /// once so a cross-day reschedule is seen either fully or not at all.
    /// Retries if a ledger appears while locking; `None` if that keeps happening.
    async fn snapshot_days(&self) -> Option<Vec<Event>> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let mut days: Vec<_> = self
                .days
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect();
            days.sort_by_key(|(date, _)| *date);

            let mut guards = Vec::with_capacity(days.len());
            for (_, day) in &days {
                guards.push(day.read().await);
            }
            if self.days.len() != guards.len() {
                continue;
            }
            return Some(
                guards
                    .iter()
                    .flat_map(|guard| guard.appointments.iter().cloned())
                    .map(Event::AppointmentBooked)
                    .collect(),
            );
        }
        None
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    // ── Shared checks ────────────────────────────────────────

    /// Client bookings must start on the slot grid and respect the lead time.
    /// Staff-created bookings only need to fit the open hours.
    fn check_bookable(
        &self,
        hours: &DayHours,
        start: Ms,
        service: &Service,
        origin: Origin,
        now: Ms,
    ) -> Result<(), EngineError> {
        if start - now > MAX_BOOKING_HORIZON_DAYS * 24 * HOUR_MS {
            return Err(EngineError::LimitExceeded("start is beyond the booking horizon"));
        }
        let minute = self
            .config
            .zone
            .minute_of_day(start)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        if self.config.zone.instant(hours.date, minute) != start {
            return Err(EngineError::NotBookable(start));
        }
        let duration = service.duration_minutes;
        let offered = if origin == Origin::AdminCreated {
            hours.fits(minute, duration)
        } else {
            start >= now + self.config.min_lead_minutes as Ms * MINUTE_MS
                && SlotGrid::new(&hours.intervals, self.config.slot_granularity_minutes, duration)
                    .any(|m| m == minute)
        };
        if !offered {
            return Err(EngineError::NotBookable(start));
        }
        Ok(())
    }

    /// Entitlement check for a plan-covered booking on `date`. The caller holds
    /// the subscription's write lock. `exclude` leaves out the appointment being
    /// rescheduled.
    async fn authorize_booking(
        &self,
        sub: &Subscription,
        service: &Service,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let plan = self.plan_of(sub)?;
        let usage = self.usage_on(sub, date, exclude).await?;
        authorize(sub, plan, service, &usage).map_err(|reason| {
            metrics::counter!(ENTITLEMENT_DENIALS_TOTAL, "reason" => reason.label()).increment(1);
            debug!(subscription = %sub.id, reason = reason.label(), "entitlement denied");
            EngineError::EntitlementDenied(reason)
        })
    }

    /// Sessions `sub` has consumed in the billing cycle and ISO week containing `date`.
    pub(super) async fn usage_on(
        &self,
        sub: &Subscription,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<Usage, EngineError> {
        let cycle = billing_cycle(sub.start_date, date).ok_or_else(|| {
            EngineError::Integrity(format!("no billing cycle for {date} from {}", sub.start_date))
        })?;
        let week = iso_week(date);
        let mut total = Usage::default();
        for day_date in cycle.union(&week).days() {
            let Some(day) = self.existing_day(day_date) else {
                continue;
            };
            let guard = day.read().await;
            let usage = count_usage(
                guard.appointments.iter().map(|a| (day_date, a)),
                sub.id,
                &cycle,
                &week,
                |service_id| self.is_facial(service_id),
                exclude,
            );
            total.monthly += usage.monthly;
            total.weekly += usage.weekly;
            total.facial += usage.facial;
        }
        Ok(total)
    }
}

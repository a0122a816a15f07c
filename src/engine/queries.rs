use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_BOOKING_HORIZON_DAYS;
use crate::model::*;

use super::conflict::partition_slots;
use super::entitlement::remaining;
use super::{Engine, EngineError, SlotGrid};

impl Engine {
    /// Slot board for one service on one date. Every grid slot at or past the
    /// lead time lands in exactly one of `available` or `booked`; a closed day
    /// yields an empty board carrying the closure reason.
    pub async fn get_available_slots(
        &self,
        date: NaiveDate,
        service_id: Ulid,
    ) -> Result<SlotBoard, EngineError> {
        let service = self.service(&service_id)?;
        let today = self.today()?;
        if (date - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
            return Err(EngineError::LimitExceeded("date is beyond the booking horizon"));
        }
        let hours = self.hours_on(date);
        let mut board = SlotBoard {
            date,
            service_id,
            closure: hours.closure.clone(),
            holiday: hours.holiday.clone(),
            available: Vec::new(),
            booked: Vec::new(),
        };
        if hours.is_closed() {
            return Ok(board);
        }

        let earliest = self.clock.now_ms() + self.config.min_lead_minutes as Ms * MINUTE_MS;
        let zone = self.config.zone;
        let candidates: Vec<Ms> = SlotGrid::new(
            &hours.intervals,
            self.config.slot_granularity_minutes,
            service.duration_minutes,
        )
        .map(|minute| zone.instant(date, minute))
        .filter(|start| *start >= earliest)
        .collect();

        let occupied: Vec<Span> = match self.existing_day(date) {
            Some(day) => day.read().await.occupied().copied().collect(),
            None => Vec::new(),
        };
        let (available, booked) = partition_slots(
            candidates,
            service.duration_minutes as Ms * MINUTE_MS,
            &occupied,
        );
        board.available = available;
        board.booked = booked;
        Ok(board)
    }

    /// Sessions left in the current billing cycle and ISO week.
    pub async fn get_remaining_entitlement(
        &self,
        subscription_id: Ulid,
    ) -> Result<Remaining, EngineError> {
        let sub = self
            .get_subscription(&subscription_id)
            .ok_or(EngineError::NotFound(subscription_id))?;
        let snapshot = sub.read().await.clone();
        let plan = self.plan_of(&snapshot)?;
        let usage = self.usage_on(&snapshot, self.today()?, None).await?;
        Ok(remaining(&snapshot, plan, &usage))
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        let date = self.current_date(id)?;
        let day = self.existing_day(date)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    /// The client's appointments in start order, minus those they hid.
    pub async fn client_history(&self, client_id: &Ulid) -> Vec<Appointment> {
        let ids = self
            .client_appointments
            .get(client_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let hidden = match self.hidden.get(client_id).map(|e| e.value().clone()) {
            Some(set) => set.read().await.clone(),
            None => Default::default(),
        };

        let mut history = Vec::with_capacity(ids.len());
        for id in ids.iter().filter(|id| !hidden.contains(*id)) {
            if let Some(appt) = self.get_appointment(id).await {
                history.push(appt);
            }
        }
        history.sort_by_key(|a| a.span.start);
        history
    }

    /// Every appointment starting on `date`, canceled ones included.
    pub async fn appointments_on(&self, date: NaiveDate) -> Vec<Appointment> {
        match self.existing_day(date) {
            Some(day) => day.read().await.appointments.clone(),
            None => Vec::new(),
        }
    }

    pub async fn subscription(&self, id: &Ulid) -> Option<Subscription> {
        let sub = self.get_subscription(id)?;
        let snapshot = sub.read().await.clone();
        Some(snapshot)
    }

    /// The client's live (non-canceled) subscription, if any.
    pub async fn current_subscription(&self, client_id: &Ulid) -> Option<Subscription> {
        let sub = self.latest_subscription(client_id)?;
        let snapshot = sub.read().await.clone();
        (snapshot.status != SubscriptionStatus::Canceled).then_some(snapshot)
    }
}

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::catalog::Catalog;
use crate::clock::{ManualClock, ReferenceZone};
use crate::config::SystemConfig;
use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;

const HAIRCUT: Ulid = Ulid(0x11);
const FACIAL: Ulid = Ulid(0x12);
const MASSAGE: Ulid = Ulid(0x13);
const BASIC: Ulid = Ulid(0x21);
const WEEKLY: Ulid = Ulid(0x22);
const HAIR_ONLY: Ulid = Ulid(0x23);

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// 2026-03-02 is a Monday.
fn monday() -> NaiveDate {
    date(2026, 3, 2)
}

fn at(day: NaiveDate, hour: u32) -> Ms {
    ReferenceZone::utc().instant(day, hour * 60)
}

fn at_minute(day: NaiveDate, hour: u32, minute: u32) -> Ms {
    ReferenceZone::utc().instant(day, hour * 60 + minute)
}

fn hours_of(starts: &[Ms], day: NaiveDate) -> Vec<u32> {
    starts
        .iter()
        .map(|s| ((s - at(day, 0)) / HOUR_MS) as u32)
        .collect()
}

fn service(id: Ulid, name: &str, minutes: u32, category: ServiceCategory) -> Service {
    Service {
        id,
        name: name.into(),
        duration_minutes: minutes,
        price_cents: 10_000,
        category,
        plan_coverable: true,
    }
}

fn plan(id: Ulid, monthly: u32, weekly: Option<u32>, facial: Option<u32>, covered: Coverage) -> SubscriptionPlan {
    SubscriptionPlan {
        id,
        name: format!("plan {id}"),
        tier: "standard".into(),
        price_cents: 30_000,
        max_treatments_per_month: monthly,
        max_treatments_per_week: weekly,
        max_facial_per_month: facial,
        covered_services: covered,
    }
}

/// Mon–Sat 09:00–12:00 and 13:00–18:00, closed Sunday.
fn lunch_schedule() -> BusinessSchedule {
    let mut schedule = BusinessSchedule::default();
    for day in schedule.days.iter_mut().skip(1) {
        *day = DaySchedule {
            open: true,
            intervals: vec![MinuteRange::new(540, 720), MinuteRange::new(780, 1080)],
        };
    }
    schedule
}

fn catalog() -> Arc<Catalog> {
    let services = vec![
        service(HAIRCUT, "Haircut", 60, ServiceCategory::Hair),
        service(FACIAL, "Facial", 60, ServiceCategory::Facial),
        service(MASSAGE, "Massage", 90, ServiceCategory::Massage),
    ];
    let plans = vec![
        plan(BASIC, 4, None, None, Coverage::All),
        plan(WEEKLY, 8, Some(2), Some(1), Coverage::All),
        plan(HAIR_ONLY, 4, None, None, Coverage::Only(HashSet::from([HAIRCUT]))),
    ];
    let holidays = vec![
        Holiday {
            date: date(2026, 4, 21),
            name: "Tiradentes".into(),
            scope: HolidayScope::National,
            closes_at: None,
        },
        Holiday {
            date: date(2026, 3, 19),
            name: "Sao Jose".into(),
            scope: HolidayScope::Regional,
            closes_at: Some(720),
        },
        Holiday {
            date: date(2026, 3, 20),
            name: "Founders Day".into(),
            scope: HolidayScope::Regional,
            closes_at: None,
        },
    ];
    Arc::new(Catalog::new(services, plans, lunch_schedule(), holidays).unwrap())
}

fn journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("salond_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(path: &Path, clock: &Arc<ManualClock>) -> Engine {
    Engine::new(
        path.to_path_buf(),
        catalog(),
        SystemConfig::default(),
        clock.clone(),
        Arc::new(NotifyHub::new()),
    )
    .unwrap()
}

/// Engine with its clock at Sunday 2026-03-01 08:00.
fn salon(name: &str) -> (Engine, Arc<ManualClock>, PathBuf) {
    let path = journal_path(name);
    let clock = Arc::new(ManualClock::new(at(date(2026, 3, 1), 8)));
    (open_engine(&path, &clock), clock, path)
}

async fn book(
    engine: &Engine,
    client: Ulid,
    service_id: Ulid,
    start: Ms,
    origin: Origin,
) -> Result<Appointment, EngineError> {
    engine
        .create_appointment(Ulid::new(), client, service_id, start, origin, None)
        .await
}

async fn subscribed(engine: &Engine, client: Ulid, plan_id: Ulid) -> Ulid {
    let id = Ulid::new();
    engine
        .subscribe(id, client, plan_id, date(2026, 3, 1), None)
        .await
        .unwrap();
    id
}

// ── Hours and slot listing ───────────────────────────────

#[tokio::test]
async fn slots_skip_lunch_break() {
    let (engine, _clock, _) = salon("slots_lunch.journal");
    let board = engine.get_available_slots(monday(), HAIRCUT).await.unwrap();
    assert_eq!(board.closure, None);
    assert_eq!(hours_of(&board.available, monday()), vec![9, 10, 11, 13, 14, 15, 16, 17]);
    assert!(board.booked.is_empty());
}

#[tokio::test]
async fn long_service_gets_fewer_slots() {
    let (engine, _clock, _) = salon("slots_long.journal");
    let board = engine.get_available_slots(monday(), MASSAGE).await.unwrap();
    // 90 minutes: 11:00 would run into lunch, 17:00 past closing.
    assert_eq!(hours_of(&board.available, monday()), vec![9, 10, 13, 14, 15, 16]);
}

#[tokio::test]
async fn booked_slot_is_listed_not_hidden() {
    let (engine, _clock, _) = salon("slots_booked.journal");
    let grid = engine.get_available_slots(monday(), HAIRCUT).await.unwrap().available;
    assert_ok!(book(&engine, Ulid::new(), HAIRCUT, at(monday(), 10), Origin::Single).await);

    let board = engine.get_available_slots(monday(), HAIRCUT).await.unwrap();
    assert_eq!(hours_of(&board.booked, monday()), vec![10]);
    assert!(board.available.iter().all(|s| !board.booked.contains(s)));
    let mut union: Vec<Ms> = board.available.iter().chain(&board.booked).copied().collect();
    union.sort();
    assert_eq!(union, grid);
}

#[tokio::test]
async fn slot_listing_is_repeatable() {
    let (engine, _clock, _) = salon("slots_repeat.journal");
    assert_ok!(book(&engine, Ulid::new(), MASSAGE, at(monday(), 13), Origin::Single).await);
    let first = engine.get_available_slots(monday(), HAIRCUT).await.unwrap();
    let second = engine.get_available_slots(monday(), HAIRCUT).await.unwrap();
    assert_eq!(first, second);
    // 13:00–14:30 blocks both 13:00 and 14:00 for a one-hour service.
    assert_eq!(hours_of(&first.booked, monday()), vec![13, 14]);
}

#[tokio::test]
async fn closed_days_have_no_slots() {
    let (engine, _clock, _) = salon("slots_closed.journal");

    let sunday = engine.get_available_slots(date(2026, 3, 8), HAIRCUT).await.unwrap();
    assert_eq!(sunday.closure, Some(Closure::Weekly));
    assert!(sunday.available.is_empty() && sunday.booked.is_empty());

    let holiday = engine.get_available_slots(date(2026, 4, 21), HAIRCUT).await.unwrap();
    assert_eq!(holiday.closure, Some(Closure::Holiday("Tiradentes".into())));
    assert!(holiday.available.is_empty());

    match book(&engine, Ulid::new(), HAIRCUT, at(date(2026, 4, 21), 10), Origin::Single).await {
        Err(EngineError::ClosedDay(d)) => assert_eq!(d, date(2026, 4, 21)),
        other => panic!("expected ClosedDay, got {other:?}"),
    }
}

#[tokio::test]
async fn regional_holiday_annotates_or_shortens() {
    let (engine, _clock, _) = salon("slots_regional.journal");

    let open = engine.get_available_slots(date(2026, 3, 20), HAIRCUT).await.unwrap();
    assert_eq!(open.closure, None);
    assert_eq!(open.holiday.as_deref(), Some("Founders Day"));
    assert_eq!(open.available.len(), 8);

    let short = engine.get_available_slots(date(2026, 3, 19), HAIRCUT).await.unwrap();
    assert_eq!(hours_of(&short.available, date(2026, 3, 19)), vec![9, 10, 11]);
}

#[tokio::test]
async fn lead_time_hides_imminent_slots() {
    let (engine, clock, _) = salon("slots_lead.journal");
    clock.set(at_minute(monday(), 8, 45));

    let board = engine.get_available_slots(monday(), HAIRCUT).await.unwrap();
    assert_eq!(hours_of(&board.available, monday())[0], 10);
    assert!(matches!(
        book(&engine, Ulid::new(), HAIRCUT, at(monday(), 9), Origin::Single).await,
        Err(EngineError::NotBookable(_))
    ));
    // Staff may still squeeze it in.
    assert_ok!(book(&engine, Ulid::new(), HAIRCUT, at(monday(), 9), Origin::AdminCreated).await);
}

#[tokio::test]
async fn off_grid_start_is_staff_only() {
    let (engine, _clock, _) = salon("off_grid.journal");
    let half_past = at_minute(monday(), 9, 30);
    assert!(matches!(
        book(&engine, Ulid::new(), HAIRCUT, half_past, Origin::Single).await,
        Err(EngineError::NotBookable(s)) if s == half_past
    ));
    assert_ok!(book(&engine, Ulid::new(), HAIRCUT, half_past, Origin::AdminCreated).await);
    // Staff bookings still have to fit the open hours.
    assert_err!(book(&engine, Ulid::new(), HAIRCUT, at_minute(monday(), 11, 30), Origin::AdminCreated).await);
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let (engine, _clock, _) = salon("unknown_service.journal");
    let ghost = Ulid::new();
    assert!(matches!(
        engine.get_available_slots(monday(), ghost).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));
}

// ── Booking conflicts ────────────────────────────────────

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let (engine, _clock, _) = salon("conflict_overlap.journal");
    let massage = book(&engine, Ulid::new(), MASSAGE, at(monday(), 9), Origin::Single)
        .await
        .unwrap();
    match book(&engine, Ulid::new(), HAIRCUT, at(monday(), 10), Origin::Single).await {
        Err(EngineError::SlotConflict(holder)) => assert_eq!(holder, massage.id),
        other => panic!("expected SlotConflict, got {other:?}"),
    }
    // Back-to-back is fine: half-open spans.
    assert_ok!(book(&engine, Ulid::new(), HAIRCUT, at(monday(), 11), Origin::Single).await);
}

#[tokio::test]
async fn concurrent_bookings_have_one_winner() {
    let (engine, _clock, _) = salon("conflict_race.journal");
    let engine = Arc::new(engine);
    let start = at(monday(), 14);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            book(&engine, Ulid::new(), HAIRCUT, start, Origin::Single).await
        }));
    }
    let mut won = 0;
    let mut lost = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::SlotConflict(_)) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((won, lost), (1, 15));
    assert_eq!(engine.appointments_on(monday()).await.len(), 1);
}

#[tokio::test]
async fn canceled_appointment_frees_slot() {
    let (engine, _clock, _) = salon("conflict_cancel.journal");
    let first = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 10), Origin::Single)
        .await
        .unwrap();
    assert_ok!(engine.cancel_appointment(first.id, Actor::Client, None).await);
    assert_ok!(book(&engine, Ulid::new(), HAIRCUT, at(monday(), 10), Origin::Single).await);
    // The canceled one stays in the ledger for history.
    assert_eq!(engine.appointments_on(monday()).await.len(), 2);
}

#[tokio::test]
async fn duplicate_appointment_id_rejected() {
    let (engine, _clock, _) = salon("duplicate_id.journal");
    let id = Ulid::new();
    let client = Ulid::new();
    assert_ok!(
        engine
            .create_appointment(id, client, HAIRCUT, at(monday(), 9), Origin::Single, None)
            .await
    );
    assert!(matches!(
        engine
            .create_appointment(id, client, HAIRCUT, at(monday(), 13), Origin::Single, None)
            .await,
        Err(EngineError::AlreadyExists(dup)) if dup == id
    ));
}

// ── Lifecycle and payment ────────────────────────────────

#[tokio::test]
async fn initial_status_follows_origin() {
    let (engine, _clock, _) = salon("lifecycle_initial.journal");
    let client = Ulid::new();
    let single = book(&engine, client, HAIRCUT, at(monday(), 9), Origin::Single).await.unwrap();
    assert_eq!((single.status, single.payment), (AppointmentStatus::Pending, PaymentStatus::Pending));
    let voucher = book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Voucher).await.unwrap();
    assert_eq!((voucher.status, voucher.payment), (AppointmentStatus::Pending, PaymentStatus::None));
    let admin = book(&engine, client, HAIRCUT, at(monday(), 11), Origin::AdminCreated).await.unwrap();
    assert_eq!((admin.status, admin.payment), (AppointmentStatus::Confirmed, PaymentStatus::Pending));
}

#[tokio::test]
async fn terminal_states_refuse_changes() {
    let (engine, _clock, _) = salon("lifecycle_terminal.journal");
    let appt = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 9), Origin::Single).await.unwrap();

    assert!(matches!(
        engine.complete_appointment(appt.id).await,
        Err(EngineError::InvalidTransition { from: AppointmentStatus::Pending, .. })
    ));
    assert_ok!(engine.confirm_appointment(appt.id).await);
    let done = engine.complete_appointment(appt.id).await.unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);

    assert!(matches!(
        engine.cancel_appointment(appt.id, Actor::Client, None).await,
        Err(EngineError::AlreadyTerminal(AppointmentStatus::Completed))
    ));
    assert!(matches!(
        engine.reschedule_appointment(appt.id, at(monday(), 13)).await,
        Err(EngineError::AlreadyTerminal(AppointmentStatus::Completed))
    ));
    assert!(matches!(
        engine.mark_no_show(appt.id).await,
        Err(EngineError::AlreadyTerminal(_))
    ));
}

#[tokio::test]
async fn payment_success_confirms_pending_booking() {
    let (engine, _clock, _) = salon("payment_ok.journal");
    let appt = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 9), Origin::Single).await.unwrap();
    let paid = engine.record_payment(appt.id, PaymentOutcome::Succeeded).await.unwrap();
    assert_eq!(paid.payment, PaymentStatus::Paid);
    assert_eq!(paid.status, AppointmentStatus::Confirmed);
    // Repeated callback changes nothing.
    assert_eq!(
        engine.record_payment(appt.id, PaymentOutcome::Succeeded).await.unwrap(),
        paid
    );
}

#[tokio::test]
async fn payment_failure_cancels_single_booking_only() {
    let (engine, _clock, _) = salon("payment_failed.journal");
    let single = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 9), Origin::Single).await.unwrap();
    let failed = engine.record_payment(single.id, PaymentOutcome::Failed).await.unwrap();
    assert_eq!(failed.status, AppointmentStatus::Canceled);
    let cancellation = failed.cancellation.unwrap();
    assert_eq!(cancellation.actor, Actor::System);
    assert!(!cancellation.penalized);

    let admin = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 10), Origin::AdminCreated)
        .await
        .unwrap();
    assert_eq!(
        engine.record_payment(admin.id, PaymentOutcome::Failed).await.unwrap(),
        admin
    );
}

#[tokio::test]
async fn late_payment_leaves_canceled_appointment_alone() {
    let (engine, _clock, path) = salon("payment_after_cancel.journal");
    let appt = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 11), Origin::Single).await.unwrap();
    let canceled = engine.cancel_appointment(appt.id, Actor::Client, None).await.unwrap();
    let appends = engine.journal_appends_since_compact().await;

    let after = engine.record_payment(appt.id, PaymentOutcome::Succeeded).await.unwrap();
    assert_eq!(after, canceled);
    assert_eq!(after.payment, PaymentStatus::Pending);
    assert_eq!(engine.journal_appends_since_compact().await, appends);
    assert_eq!(Journal::replay(&path).unwrap().len() as u64, appends);
}

// ── Cancellation and reschedule policy ───────────────────

#[tokio::test]
async fn late_client_cancellation_is_penalized() {
    let (engine, clock, _) = salon("policy_penalty.journal");
    let client = Ulid::new();
    let sub = subscribed(&engine, client, BASIC).await;
    let soon = book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Subscription).await.unwrap();
    let later = book(&engine, client, HAIRCUT, at(date(2026, 3, 3), 10), Origin::Subscription)
        .await
        .unwrap();
    clock.set(at(monday(), 8));

    let canceled = engine.cancel_appointment(soon.id, Actor::Client, None).await.unwrap();
    assert!(canceled.cancellation.unwrap().penalized);
    // Penalized sessions stay consumed.
    assert_eq!(engine.get_remaining_entitlement(sub).await.unwrap().monthly, 2);

    let canceled = engine
        .cancel_appointment(later.id, Actor::Client, Some("travel".into()))
        .await
        .unwrap();
    let cancellation = canceled.cancellation.unwrap();
    assert!(!cancellation.penalized);
    assert_eq!(cancellation.reason.as_deref(), Some("travel"));
    assert_eq!(engine.get_remaining_entitlement(sub).await.unwrap().monthly, 3);
}

#[tokio::test]
async fn late_staff_cancellation_is_penalized_too() {
    let (engine, clock, _) = salon("policy_staff.journal");
    let client = Ulid::new();
    let sub = subscribed(&engine, client, BASIC).await;
    let soon = book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Subscription).await.unwrap();
    let later = book(&engine, client, HAIRCUT, at(date(2026, 3, 3), 10), Origin::Subscription)
        .await
        .unwrap();
    clock.set(at(monday(), 8));

    let canceled = engine.cancel_appointment(soon.id, Actor::Staff, None).await.unwrap();
    let cancellation = canceled.cancellation.unwrap();
    assert_eq!(cancellation.actor, Actor::Staff);
    assert!(cancellation.penalized);
    assert_eq!(engine.get_remaining_entitlement(sub).await.unwrap().monthly, 2);

    // Outside the window the session comes back.
    let canceled = engine.cancel_appointment(later.id, Actor::Staff, None).await.unwrap();
    assert!(!canceled.cancellation.unwrap().penalized);
    assert_eq!(engine.get_remaining_entitlement(sub).await.unwrap().monthly, 3);
}

#[tokio::test]
async fn reschedule_blocked_inside_notice_window() {
    let (engine, clock, _) = salon("policy_reschedule_blocked.journal");
    let appt = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 13), Origin::Single).await.unwrap();
    clock.set(at(monday(), 8));

    match engine.reschedule_appointment(appt.id, at(date(2026, 3, 3), 13)).await {
        Err(EngineError::RescheduleBlocked { hours_until }) => {
            assert!((hours_until - 5.0).abs() < 1e-9)
        }
        other => panic!("expected RescheduleBlocked, got {other:?}"),
    }
    assert_eq!(engine.get_appointment(&appt.id).await.unwrap(), appt);
}

#[tokio::test]
async fn reschedule_moves_to_another_day() {
    let (engine, _clock, _) = salon("reschedule_move.journal");
    let client = Ulid::new();
    let appt = book(&engine, client, HAIRCUT, at(monday(), 13), Origin::Single).await.unwrap();
    let tuesday = date(2026, 3, 3);

    let moved = engine.reschedule_appointment(appt.id, at(tuesday, 10)).await.unwrap();
    assert_eq!(moved.span, Span::starting_at(at(tuesday, 10), 60));
    assert_eq!(moved.status, appt.status);

    let old_day = engine.get_available_slots(monday(), HAIRCUT).await.unwrap();
    assert!(old_day.booked.is_empty());
    let new_day = engine.get_available_slots(tuesday, HAIRCUT).await.unwrap();
    assert_eq!(hours_of(&new_day.booked, tuesday), vec![10]);
    assert_eq!(engine.client_history(&client).await, vec![moved]);
}

#[tokio::test]
async fn reschedule_within_day_ignores_own_slot() {
    let (engine, _clock, _) = salon("reschedule_same_day.journal");
    let appt = book(&engine, Ulid::new(), MASSAGE, at(monday(), 9), Origin::Single).await.unwrap();
    // 10:00–11:30 overlaps the current 09:00–10:30 window only.
    let moved = engine.reschedule_appointment(appt.id, at(monday(), 10)).await.unwrap();
    assert_eq!(moved.span.start, at(monday(), 10));
    assert_eq!(engine.appointments_on(monday()).await.len(), 1);
}

#[tokio::test]
async fn failed_reschedule_keeps_original() {
    let (engine, _clock, _) = salon("reschedule_conflict.journal");
    let mine = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 9), Origin::Single).await.unwrap();
    let theirs = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 11), Origin::Single).await.unwrap();

    match engine.reschedule_appointment(mine.id, at(monday(), 11)).await {
        Err(EngineError::SlotConflict(holder)) => assert_eq!(holder, theirs.id),
        other => panic!("expected SlotConflict, got {other:?}"),
    }
    assert!(matches!(
        engine.reschedule_appointment(mine.id, at(date(2026, 3, 8), 10)).await,
        Err(EngineError::ClosedDay(_))
    ));
    assert_eq!(engine.get_appointment(&mine.id).await.unwrap(), mine);
}

// ── Entitlement ──────────────────────────────────────────

#[tokio::test]
async fn monthly_limit_and_cancel_frees_session() {
    let (engine, _clock, _) = salon("entitlement_monthly.journal");
    let client = Ulid::new();
    let sub = subscribed(&engine, client, BASIC).await;

    let mut booked = Vec::new();
    for hour in [9, 10, 11, 13] {
        booked.push(
            book(&engine, client, HAIRCUT, at(monday(), hour), Origin::Subscription)
                .await
                .unwrap(),
        );
    }
    assert!(booked.iter().all(|a| a.subscription_id == Some(sub)));
    assert_eq!(engine.get_remaining_entitlement(sub).await.unwrap().monthly, 0);

    assert!(matches!(
        book(&engine, client, HAIRCUT, at(monday(), 14), Origin::Subscription).await,
        Err(EngineError::EntitlementDenied(DenialReason::MonthlyLimitReached))
    ));

    // Well outside the notice window: the session comes back.
    assert_ok!(engine.cancel_appointment(booked[3].id, Actor::Client, None).await);
    assert_ok!(book(&engine, client, HAIRCUT, at(monday(), 14), Origin::Subscription).await);

    // The next cycle starts fresh.
    assert_ok!(book(&engine, client, HAIRCUT, at(date(2026, 4, 1), 9), Origin::Subscription).await);
}

#[tokio::test]
async fn concurrent_covered_bookings_respect_limit() {
    let (engine, _clock, _) = salon("entitlement_race.journal");
    let engine = Arc::new(engine);
    let client = Ulid::new();
    subscribed(&engine, client, BASIC).await;

    let mut tasks = Vec::new();
    for day in 2..=7 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            book(&engine, client, HAIRCUT, at(date(2026, 3, day), 9), Origin::Subscription).await
        }));
    }
    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::EntitlementDenied(DenialReason::MonthlyLimitReached)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 4);
}

#[tokio::test]
async fn weekly_and_facial_limits() {
    let (engine, clock, _) = salon("entitlement_weekly.journal");
    let client = Ulid::new();
    let sub = subscribed(&engine, client, WEEKLY).await;

    assert_ok!(book(&engine, client, HAIRCUT, at(monday(), 9), Origin::Subscription).await);
    assert_ok!(book(&engine, client, HAIRCUT, at(date(2026, 3, 3), 9), Origin::Subscription).await);
    assert!(matches!(
        book(&engine, client, HAIRCUT, at(date(2026, 3, 4), 9), Origin::Subscription).await,
        Err(EngineError::EntitlementDenied(DenialReason::WeeklyLimitReached))
    ));
    clock.set(at(monday(), 8));
    let remaining = engine.get_remaining_entitlement(sub).await.unwrap();
    assert_eq!(remaining, Remaining { monthly: 6, weekly: Some(0) });

    // Next ISO week.
    assert_ok!(book(&engine, client, FACIAL, at(date(2026, 3, 9), 9), Origin::Subscription).await);
    assert!(matches!(
        book(&engine, client, FACIAL, at(date(2026, 3, 16), 9), Origin::Subscription).await,
        Err(EngineError::EntitlementDenied(DenialReason::FacialLimitReached))
    ));
    assert_ok!(book(&engine, client, HAIRCUT, at(date(2026, 3, 16), 9), Origin::Subscription).await);
}

#[tokio::test]
async fn coverage_and_status_gate_bookings() {
    let (engine, _clock, _) = salon("entitlement_gate.journal");

    let nobody = Ulid::new();
    assert!(matches!(
        book(&engine, nobody, HAIRCUT, at(monday(), 9), Origin::Subscription).await,
        Err(EngineError::EntitlementDenied(DenialReason::PlanInactive))
    ));

    let client = Ulid::new();
    let sub = subscribed(&engine, client, HAIR_ONLY).await;
    assert!(matches!(
        book(&engine, client, FACIAL, at(monday(), 9), Origin::Subscription).await,
        Err(EngineError::EntitlementDenied(DenialReason::ServiceNotCovered))
    ));
    // Paying for it outright is always possible.
    assert_ok!(book(&engine, client, FACIAL, at(monday(), 9), Origin::Single).await);

    assert_ok!(engine.set_subscription_status(sub, SubscriptionStatus::PastDue).await);
    assert!(matches!(
        book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Subscription).await,
        Err(EngineError::EntitlementDenied(DenialReason::PlanInactive))
    ));
    assert_eq!(
        engine.get_remaining_entitlement(sub).await.unwrap(),
        Remaining { monthly: 0, weekly: None }
    );

    assert_ok!(engine.set_subscription_status(sub, SubscriptionStatus::Active).await);
    assert_ok!(book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Subscription).await);
}

#[tokio::test]
async fn plan_change_applies_to_next_booking() {
    let (engine, _clock, _) = salon("entitlement_plan_change.journal");
    let client = Ulid::new();
    let sub = subscribed(&engine, client, HAIR_ONLY).await;
    assert_err!(book(&engine, client, FACIAL, at(monday(), 9), Origin::Subscription).await);

    let changed = engine.change_plan(sub, BASIC).await.unwrap();
    assert_eq!(changed.plan_id, BASIC);
    assert_ok!(book(&engine, client, FACIAL, at(monday(), 9), Origin::Subscription).await);
}

// ── Subscriptions ────────────────────────────────────────

#[tokio::test]
async fn subscription_lifecycle() {
    let (engine, clock, _) = salon("subscription_lifecycle.journal");
    let client = Ulid::new();
    let id = Ulid::new();
    let commitment = date(2026, 6, 1);
    engine
        .subscribe(id, client, BASIC, date(2026, 3, 1), Some(commitment))
        .await
        .unwrap();

    assert!(matches!(
        engine.subscribe(Ulid::new(), client, WEEKLY, date(2026, 3, 1), None).await,
        Err(EngineError::AlreadyExists(existing)) if existing == id
    ));
    assert!(matches!(
        engine.cancel_subscription(id).await,
        Err(EngineError::CommitmentActive(end)) if end == commitment
    ));

    clock.set(at(commitment, 10));
    let ended = engine.cancel_subscription(id).await.unwrap();
    assert_eq!(ended.status, SubscriptionStatus::Canceled);
    assert_eq!(ended.end_date, Some(commitment));
    assert!(engine.current_subscription(&client).await.is_none());

    assert!(matches!(
        engine.change_plan(id, WEEKLY).await,
        Err(EngineError::SubscriptionInactive(_))
    ));
    assert!(matches!(
        engine.cancel_subscription(id).await,
        Err(EngineError::SubscriptionInactive(_))
    ));

    // A fresh subscription is allowed once the old one ended.
    let again = Ulid::new();
    assert_ok!(engine.subscribe(again, client, WEEKLY, commitment, None).await);
    assert_eq!(engine.current_subscription(&client).await.unwrap().id, again);
}

#[tokio::test]
async fn subscribe_to_unknown_plan_fails() {
    let (engine, _clock, _) = salon("subscription_unknown_plan.journal");
    let ghost = Ulid::new();
    assert!(matches!(
        engine.subscribe(Ulid::new(), Ulid::new(), ghost, date(2026, 3, 1), None).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));
}

// ── History ──────────────────────────────────────────────

#[tokio::test]
async fn hidden_appointments_leave_history_only() {
    let (engine, _clock, _) = salon("history_hidden.journal");
    let client = Ulid::new();
    let first = book(&engine, client, HAIRCUT, at(monday(), 9), Origin::Single).await.unwrap();
    let second = book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Single).await.unwrap();

    assert_ok!(engine.hide_from_history(client, first.id).await);
    assert_ok!(engine.hide_from_history(client, first.id).await);
    assert_eq!(engine.client_history(&client).await, vec![second]);
    // The record itself is untouched.
    assert_eq!(engine.get_appointment(&first.id).await.unwrap(), first);

    let stranger = Ulid::new();
    assert!(matches!(
        engine.hide_from_history(stranger, first.id).await,
        Err(EngineError::NotOwner(_))
    ));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn committed_events_reach_the_client() {
    let (engine, _clock, _) = salon("notify_client.journal");
    let client = Ulid::new();
    let mut rx = engine.notify.subscribe_client(client);

    let appt = book(&engine, client, HAIRCUT, at(monday(), 9), Origin::Single).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Event::AppointmentBooked(appt.clone()));

    assert_ok!(engine.cancel_appointment(appt.id, Actor::Client, None).await);
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::AppointmentCanceled { id, .. } if id == appt.id
    ));

    // Refused requests publish nothing.
    assert_ok!(book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Single).await);
    assert_err!(book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Voucher).await);
    assert!(matches!(rx.recv().await.unwrap(), Event::AppointmentBooked(_)));
    assert!(rx.try_recv().is_err());
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let (engine, clock, path) = salon("replay.journal");
    let client = Ulid::new();
    let sub = subscribed(&engine, client, BASIC).await;
    let kept = book(&engine, client, HAIRCUT, at(monday(), 9), Origin::Subscription).await.unwrap();
    let canceled = book(&engine, client, HAIRCUT, at(monday(), 10), Origin::Single).await.unwrap();
    let moved = book(&engine, client, MASSAGE, at(monday(), 13), Origin::Single).await.unwrap();
    engine.cancel_appointment(canceled.id, Actor::Client, None).await.unwrap();
    let moved = engine
        .reschedule_appointment(moved.id, at(date(2026, 3, 3), 13))
        .await
        .unwrap();
    engine.hide_from_history(client, canceled.id).await.unwrap();
    engine.set_subscription_status(sub, SubscriptionStatus::PastDue).await.unwrap();

    let history = engine.client_history(&client).await;
    let canceled = engine.get_appointment(&canceled.id).await.unwrap();
    let subscription = engine.subscription(&sub).await.unwrap();
    drop(engine);

    let reopened = open_engine(&path, &clock);
    assert_eq!(reopened.client_history(&client).await, history);
    assert_eq!(history, vec![kept, moved]);
    assert_eq!(reopened.get_appointment(&canceled.id).await.unwrap(), canceled);
    assert_eq!(reopened.subscription(&sub).await.unwrap(), subscription);
    let board = reopened.get_available_slots(date(2026, 3, 3), HAIRCUT).await.unwrap();
    assert_eq!(hours_of(&board.booked, date(2026, 3, 3)), vec![13, 14]);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, clock, path) = salon("compaction.journal");
    let client = Ulid::new();
    let sub = subscribed(&engine, client, BASIC).await;
    for hour in [9, 10, 11] {
        let appt = book(&engine, client, HAIRCUT, at(monday(), hour), Origin::Subscription)
            .await
            .unwrap();
        if hour == 10 {
            engine.cancel_appointment(appt.id, Actor::Client, None).await.unwrap();
            engine.hide_from_history(client, appt.id).await.unwrap();
        }
    }
    assert_eq!(engine.journal_appends_since_compact().await, 6);

    engine.compact_journal().await.unwrap();
    assert_eq!(engine.journal_appends_since_compact().await, 0);
    let history = engine.client_history(&client).await;
    let remaining = engine.get_remaining_entitlement(sub).await.unwrap();
    drop(engine);

    let reopened = open_engine(&path, &clock);
    assert_eq!(reopened.client_history(&client).await, history);
    assert_eq!(reopened.get_remaining_entitlement(sub).await.unwrap(), remaining);
    assert_eq!(remaining.monthly, 2);
}

#[tokio::test]
async fn replay_keeps_one_copy_of_a_moved_appointment() {
    let path = journal_path("replay_moved_twice.journal");
    let clock = Arc::new(ManualClock::new(at(date(2026, 3, 1), 8)));
    let tuesday = date(2026, 3, 3);
    let client = Ulid::new();
    let sub = Subscription {
        id: Ulid::new(),
        client_id: client,
        plan_id: BASIC,
        status: SubscriptionStatus::Active,
        start_date: date(2026, 3, 1),
        end_date: None,
        commitment_end: None,
    };
    let on_tuesday = Appointment {
        id: Ulid::new(),
        client_id: client,
        service_id: HAIRCUT,
        subscription_id: Some(sub.id),
        span: Span::starting_at(at(tuesday, 10), 60),
        status: AppointmentStatus::Confirmed,
        origin: Origin::Subscription,
        payment: PaymentStatus::None,
        notes: None,
        cancellation: None,
        created_at: at(date(2026, 3, 1), 8),
    };
    let on_monday = Appointment {
        span: Span::starting_at(at(monday(), 10), 60),
        ..on_tuesday.clone()
    };

    // Snapshot taken mid-move, followed by the retained reschedule.
    let mut journal = Journal::open(&path).unwrap();
    for event in [
        Event::SubscriptionStarted(sub.clone()),
        Event::AppointmentBooked(on_tuesday.clone()),
        Event::AppointmentBooked(on_monday),
        Event::AppointmentRescheduled {
            id: on_tuesday.id,
            span: on_tuesday.span,
        },
    ] {
        journal.append(&event).unwrap();
    }
    drop(journal);

    let engine = open_engine(&path, &clock);
    assert!(engine.appointments_on(monday()).await.is_empty());
    assert_eq!(engine.appointments_on(tuesday).await, vec![on_tuesday.clone()]);
    assert_eq!(engine.client_history(&client).await.len(), 1);
    assert_eq!(engine.get_remaining_entitlement(sub.id).await.unwrap().monthly, 3);

    engine.cancel_appointment(on_tuesday.id, Actor::Staff, None).await.unwrap();
    let board = engine.get_available_slots(tuesday, HAIRCUT).await.unwrap();
    assert!(board.booked.is_empty());
    assert!(board.available.contains(&at(tuesday, 10)));
    assert_eq!(engine.get_remaining_entitlement(sub.id).await.unwrap().monthly, 4);
}

#[tokio::test]
async fn compaction_after_cross_day_reschedule_replays_cleanly() {
    let (engine, clock, path) = salon("compaction_moved.journal");
    let tuesday = date(2026, 3, 3);
    let appt = book(&engine, Ulid::new(), HAIRCUT, at(monday(), 10), Origin::Single).await.unwrap();
    engine.reschedule_appointment(appt.id, at(tuesday, 10)).await.unwrap();

    engine.compact_journal().await.unwrap();
    let moved = engine.get_appointment(&appt.id).await.unwrap();
    drop(engine);

    let reopened = open_engine(&path, &clock);
    assert!(reopened.appointments_on(monday()).await.is_empty());
    assert_eq!(reopened.appointments_on(tuesday).await, vec![moved]);
}

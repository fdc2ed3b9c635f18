use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal_macros::dec;
use tokio::sync::broadcast;
use ulid::Ulid;

use deskbook::clock::ManualClock;
use deskbook::config::Policy;
use deskbook::effects::{Collaborators, Intent, Recorder, Template};
use deskbook::engine::{Engine, ErrorKind};
use deskbook::model::*;

// ── Test infrastructure ──────────────────────────────────────

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("deskbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("deskbook.wal")
}

fn on(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 9, 14)
        .unwrap()
        .and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap())
}

fn slot(from: u32, to: u32) -> TimeSlot {
    TimeSlot::new(
        on(0, 0).date(),
        NaiveTime::from_hms_opt(from, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(to, 0, 0).unwrap(),
    )
}

async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event within a second")
        .expect("channel closed")
}

fn start() -> (Engine, Arc<ManualClock>, Arc<Recorder>) {
    let clock = Arc::new(ManualClock::new(on(8, 0)));
    let recorder = Arc::new(Recorder::new());
    let engine = Engine::new(
        wal_path(),
        Policy::default(),
        Collaborators::recording(recorder.clone()),
        clock.clone(),
    )
    .unwrap();
    (engine, clock, recorder)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn meeting_room_day_end_to_end() {
    let (engine, clock, recorder) = start();

    let room = Ulid::new();
    let rates = RateCard {
        hourly: Some(dec!(40)),
        daily: Some(dec!(250)),
        minimum_charge: Some(dec!(50)),
        ..RateCard::default()
    };
    engine
        .create_resource(Resource::new(room, "Board room", ResourceKind::MeetingRoom, 12, rates))
        .await
        .unwrap();
    let mut events = engine.notify.subscribe(room);

    let requester = Ulid::new();
    let mut req = ReservationRequest::new(room, requester, slot(10, 11), RatePlan::Hourly);
    req.attendees = 8;
    req.discount_percent = dec!(10);
    req.services.push(ServiceLine {
        description: "Coffee".into(),
        quantity: 8,
        unit_price: dec!(2.50),
    });
    let draft = engine.create_reservation(req).await.unwrap();

    // One hour at 40 lifts to the 50 minimum, then 10% off, plus 20 of coffee.
    assert_eq!(draft.charges.subtotal, dec!(50));
    assert_eq!(draft.charges.discount, dec!(5));
    assert_eq!(draft.charges.services, dec!(20));
    assert_eq!(draft.charges.total, dec!(65));
    assert!(matches!(next_event(&mut events).await, Event::ReservationCreated(r) if r.id == draft.id));

    engine.confirm(draft.id).await.unwrap();
    match next_event(&mut events).await {
        Event::ReservationUpdated { reservation, .. } => {
            assert_eq!(reservation.status, ReservationStatus::Confirmed)
        }
        other => panic!("unexpected event {other:?}"),
    }

    let open = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
    let close = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
    let windows = engine.free_windows(&room, on(0, 0).date(), open, close).await.unwrap();
    assert_eq!(windows, vec![slot(8, 10), slot(11, 18)]);

    clock.set(on(9, 55));
    engine.check_in(draft.id, Some("reception".into())).await.unwrap();
    match next_event(&mut events).await {
        Event::ReservationUpdated {
            reservation,
            resource_status,
            ..
        } => {
            assert_eq!(reservation.status, ReservationStatus::CheckedIn);
            assert_eq!(resource_status, Some(ResourceStatus::Occupied));
        }
        other => panic!("unexpected event {other:?}"),
    }

    clock.set(on(11, 0));
    let done = engine.check_out(draft.id).await.unwrap();
    assert_eq!(done.status, ReservationStatus::Completed);
    assert_eq!(done.charges.total, dec!(65));
    assert_eq!(engine.get_resource(&room).await.unwrap().status, ResourceStatus::Available);

    let seen = recorder.wait_for(4, Duration::from_secs(1)).await;
    assert!(matches!(
        &seen[0],
        Intent::Notify { template: Template::ReservationConfirmed, recipient, .. } if *recipient == requester
    ));
    assert!(matches!(&seen[1], Intent::Invoice { .. }));
    assert!(matches!(&seen[2], Intent::Grant { .. }));
    assert!(matches!(&seen[3], Intent::Revoke { .. }));
}

#[tokio::test]
async fn membership_visits_are_metered() {
    let (engine, _clock, _recorder) = start();
    let desk = Ulid::new();
    engine
        .create_resource(Resource::new(desk, "Hot desk 3", ResourceKind::Desk, 1, RateCard::default()))
        .await
        .unwrap();

    let member = Ulid::new();
    let mut pass = Entitlement::new(
        Ulid::new(),
        member,
        AccessMode::LimitedEntries,
        1,
        on(0, 0).date(),
        on(0, 0).date() + chrono::Duration::days(29),
    );
    pass.scope = vec![desk];
    let pass = engine.create_entitlement(pass).await.unwrap();
    let mut pass_events = engine.notify.subscribe(pass.id);

    // A draft entitlement cannot be booked against.
    let req = ReservationRequest::new(desk, member, slot(9, 17), RatePlan::Package).with_entitlement(pass.id);
    let err = engine.create_reservation(req.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    engine.activate_entitlement(pass.id).await.unwrap();
    assert!(matches!(next_event(&mut pass_events).await, Event::EntitlementSaved(e) if e.status == EntitlementStatus::Active));

    let visit = engine.create_reservation(req).await.unwrap();
    assert_eq!(visit.charges.total, dec!(0));
    engine.confirm(visit.id).await.unwrap();
    engine.check_in(visit.id, None).await.unwrap();

    match next_event(&mut pass_events).await {
        Event::ReservationUpdated {
            entitlement: Some(after),
            ..
        } => assert_eq!(after.remaining, 0),
        other => panic!("unexpected event {other:?}"),
    }

    let listed = engine.list_entitlements(&member).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].used, 1);

    // Nothing left for a second visit.
    let tomorrow = TimeSlot {
        date: on(0, 0).date() + chrono::Duration::days(1),
        ..slot(9, 17)
    };
    let again = ReservationRequest::new(desk, member, tomorrow, RatePlan::Package).with_entitlement(pass.id);
    let err = engine.create_reservation(again).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EntitlementExhausted);
}

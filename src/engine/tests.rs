use chrono::{NaiveTime, TimeDelta};

use super::*;
use crate::clock::FixedClock;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn room_draft(name: &str, capacity: u32) -> RoomDraft {
    RoomDraft {
        name: name.into(),
        capacity,
        location: "Building A".into(),
        equipment: "Projector, whiteboard".into(),
        status: RoomStatus::Available,
        image_url: None,
    }
}

fn user_draft(name: &str, email: &str) -> UserDraft {
    UserDraft {
        name: name.into(),
        email: email.into(),
        phone: "555-0100".into(),
        affiliation: "Research".into(),
        role: Role::Regular,
    }
}

fn booking_draft(user: Ulid, room: Ulid, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> BookingDraft {
    BookingDraft {
        user_id: user,
        room_id: room,
        date,
        start,
        end,
        reason: "Team sync".into(),
        direct_confirm: false,
    }
}

fn rule_of(err: EngineError) -> ValidationRule {
    match err {
        EngineError::Validation(v) => v.rule,
        other => panic!("expected validation error, got {other:?}"),
    }
}

fn lifecycle_of(err: EngineError) -> LifecycleRule {
    match err {
        EngineError::Lifecycle(l) => l.rule,
        other => panic!("expected lifecycle error, got {other:?}"),
    }
}

fn auth_of(err: EngineError) -> AuthError {
    match err {
        EngineError::Auth(a) => a,
        other => panic!("expected auth error, got {other:?}"),
    }
}

/// An engine pinned to noon on `day()`, with one admin, two regular users
/// and one room.
struct Fixture {
    engine: Arc<Engine>,
    clock: Arc<FixedClock>,
    path: PathBuf,
    admin: Actor,
    alice: Actor,
    bob: Actor,
    room: Room,
}

impl Fixture {
    async fn new(name: &str) -> Self {
        let path = test_wal_path(name);
        let clock = Arc::new(FixedClock::on(day()));
        let engine = Arc::new(
            Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap(),
        );
        let admin = engine
            .bootstrap_admin("admin@example.com", "Admin")
            .await
            .unwrap()
            .unwrap();
        let admin = Actor::from(&admin);
        let alice = engine
            .register_user(user_draft("Alice", "alice@example.com"), Some(&admin))
            .await
            .unwrap();
        let bob = engine
            .register_user(user_draft("Bob", "bob@example.com"), Some(&admin))
            .await
            .unwrap();
        let room = engine
            .create_room(room_draft("A-101", 8), Some(&admin))
            .await
            .unwrap();
        Self {
            engine,
            clock,
            path,
            admin,
            alice: Actor::from(&alice),
            bob: Actor::from(&bob),
            room,
        }
    }

    fn reopen(&self) -> Engine {
        Engine::new(self.path.clone(), Arc::new(NotifyHub::new()), self.clock.clone()).unwrap()
    }

    async fn book(&self, who: &Actor, start: NaiveTime, end: NaiveTime) -> Result<Booking, EngineError> {
        self.engine
            .create_booking(booking_draft(who.user_id, self.room.id, day(), start, end), Some(who))
            .await
    }
}

// ── Creation and validation ──────────────────────────────

#[tokio::test]
async fn create_booking_starts_pending() {
    let fx = Fixture::new("create_pending.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(11, 0)).await.unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.user_id, fx.alice.user_id);
    assert_eq!(b.slot.hours(), 2.0);
    assert_eq!(b.created_at, b.modified_at);
    assert_eq!(fx.engine.get_booking(b.id).await.unwrap(), b);
}

#[tokio::test]
async fn overlapping_booking_reports_conflict() {
    let fx = Fixture::new("overlap_conflict.wal").await;
    let held = fx.book(&fx.alice, t(9, 0), t(11, 0)).await.unwrap();

    let err = fx.book(&fx.bob, t(10, 0), t(12, 0)).await.unwrap_err();
    assert_eq!(err.code(), "schedule_conflict");
    match err {
        EngineError::Validation(v) => {
            let c = v.conflicting.unwrap();
            assert_eq!(c.booking_id, held.id);
            assert_eq!(c.slot, held.slot);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn touching_bookings_do_not_conflict() {
    let fx = Fixture::new("touching.wal").await;
    fx.book(&fx.alice, t(9, 0), t(11, 0)).await.unwrap();
    fx.book(&fx.bob, t(11, 0), t(13, 0)).await.unwrap();
    fx.book(&fx.bob, t(8, 0), t(9, 0)).await.unwrap();
    assert_eq!(fx.engine.booking_count(), 3);
}

#[tokio::test]
async fn operating_hours_enforced() {
    let fx = Fixture::new("operating_hours.wal").await;
    let err = fx.book(&fx.alice, t(7, 30), t(9, 0)).await.unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::OutsideOperatingHours);

    let err = fx.book(&fx.alice, t(21, 0), t(22, 30)).await.unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::OutsideOperatingHours);

    fx.book(&fx.alice, t(18, 0), t(22, 0)).await.unwrap();
}

#[tokio::test]
async fn four_hours_is_the_limit() {
    let fx = Fixture::new("duration.wal").await;
    fx.book(&fx.alice, t(8, 0), t(12, 0)).await.unwrap();
    let err = fx.book(&fx.alice, t(13, 0), t(17, 1)).await.unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::DurationExceeded);
}

#[tokio::test]
async fn past_dates_rejected_today_allowed() {
    let fx = Fixture::new("past_date.wal").await;
    let yesterday = day().pred_opt().unwrap();
    let err = fx
        .engine
        .create_booking(
            booking_draft(fx.alice.user_id, fx.room.id, yesterday, t(9, 0), t(10, 0)),
            Some(&fx.alice),
        )
        .await
        .unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::PastDate);

    // Earlier today is still today.
    fx.book(&fx.alice, t(8, 0), t(9, 0)).await.unwrap();
}

#[tokio::test]
async fn invalid_interval_checked_first() {
    let fx = Fixture::new("interval_first.wal").await;
    let yesterday = day().pred_opt().unwrap();
    let err = fx
        .engine
        .create_booking(
            booking_draft(fx.alice.user_id, fx.room.id, yesterday, t(11, 0), t(9, 0)),
            Some(&fx.alice),
        )
        .await
        .unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::InvalidInterval);

    let err = fx.book(&fx.alice, t(10, 0), t(10, 0)).await.unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::InvalidInterval);
}

#[tokio::test]
async fn maintenance_blocks_new_bookings_only() {
    let fx = Fixture::new("maintenance.wal").await;
    let existing = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();

    let mut draft = room_draft("A-101", 8);
    draft.status = RoomStatus::Maintenance;
    fx.engine.update_room(fx.room.id, draft, Some(&fx.admin)).await.unwrap();

    let err = fx.book(&fx.bob, t(12, 0), t(13, 0)).await.unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::RoomUnavailable);

    // Not invalidated retroactively.
    let kept = fx.engine.get_booking(existing.id).await.unwrap();
    assert_eq!(kept.status, BookingStatus::Pending);
}

#[tokio::test]
async fn reason_length_limited() {
    let fx = Fixture::new("reason_len.wal").await;
    let mut draft = booking_draft(fx.alice.user_id, fx.room.id, day(), t(9, 0), t(10, 0));
    draft.reason = "x".repeat(501);
    let err = fx.engine.create_booking(draft, Some(&fx.alice)).await.unwrap_err();
    assert_eq!(err.code(), "invalid_field");
}

#[tokio::test]
async fn unknown_room_and_user_not_found() {
    let fx = Fixture::new("unknown_refs.wal").await;
    let err = fx
        .engine
        .create_booking(
            booking_draft(fx.alice.user_id, Ulid::new(), day(), t(9, 0), t(10, 0)),
            Some(&fx.alice),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::Room, .. }));

    let ghost = Ulid::new();
    let err = fx
        .engine
        .create_booking(
            booking_draft(ghost, fx.room.id, day(), t(9, 0), t(10, 0)),
            Some(&fx.admin),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::User, .. }));
}

// ── Access policy on writes ──────────────────────────────

#[tokio::test]
async fn anonymous_writes_rejected() {
    let fx = Fixture::new("anonymous.wal").await;
    let err = fx
        .engine
        .create_booking(
            booking_draft(fx.alice.user_id, fx.room.id, day(), t(9, 0), t(10, 0)),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotAuthenticated);
    assert_eq!(fx.engine.booking_count(), 0);
}

#[tokio::test]
async fn regular_user_cannot_book_for_others() {
    let fx = Fixture::new("book_for_others.wal").await;
    let err = fx
        .engine
        .create_booking(
            booking_draft(fx.bob.user_id, fx.room.id, day(), t(9, 0), t(10, 0)),
            Some(&fx.alice),
        )
        .await
        .unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotOwner);

    // Admins may book on anyone's behalf.
    let b = fx
        .engine
        .create_booking(
            booking_draft(fx.bob.user_id, fx.room.id, day(), t(9, 0), t(10, 0)),
            Some(&fx.admin),
        )
        .await
        .unwrap();
    assert_eq!(b.user_id, fx.bob.user_id);
}

#[tokio::test]
async fn policy_runs_before_validation() {
    let fx = Fixture::new("policy_first.wal").await;
    // Invalid interval *and* wrong owner: the auth error wins.
    let err = fx
        .engine
        .create_booking(
            booking_draft(fx.bob.user_id, fx.room.id, day(), t(11, 0), t(9, 0)),
            Some(&fx.alice),
        )
        .await
        .unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotOwner);
}

#[tokio::test]
async fn direct_confirm_needs_admin() {
    let fx = Fixture::new("direct_confirm.wal").await;
    let mut draft = booking_draft(fx.alice.user_id, fx.room.id, day(), t(9, 0), t(10, 0));
    draft.direct_confirm = true;

    let err = fx.engine.create_booking(draft.clone(), Some(&fx.alice)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotAdmin);

    let b = fx.engine.create_booking(draft, Some(&fx.admin)).await.unwrap();
    assert_eq!(b.status, BookingStatus::Confirmed);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn admin_confirms_pending() {
    let fx = Fixture::new("confirm.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();

    let err = fx.engine.confirm_booking(b.id, Some(&fx.alice)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotAdmin);

    fx.clock.advance(TimeDelta::minutes(5));
    let confirmed = fx.engine.confirm_booking(b.id, Some(&fx.admin)).await.unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert!(confirmed.modified_at > confirmed.created_at);

    let err = fx.engine.confirm_booking(b.id, Some(&fx.admin)).await.unwrap_err();
    assert_eq!(lifecycle_of(err), LifecycleRule::AlreadyConfirmed);
}

#[tokio::test]
async fn cancel_owner_or_admin() {
    let fx = Fixture::new("cancel_policy.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();

    let err = fx.engine.cancel_booking(b.id, Some(&fx.bob)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotOwner);

    let cancelled = fx.engine.cancel_booking(b.id, Some(&fx.alice)).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);

    let b2 = fx.book(&fx.bob, t(12, 0), t(13, 0)).await.unwrap();
    fx.engine.confirm_booking(b2.id, Some(&fx.admin)).await.unwrap();
    let cancelled = fx.engine.cancel_booking(b2.id, Some(&fx.admin)).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn cancel_twice_always_already_cancelled() {
    let fx = Fixture::new("cancel_twice.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    fx.engine.cancel_booking(b.id, Some(&fx.alice)).await.unwrap();

    for actor in [&fx.alice, &fx.admin, &fx.alice] {
        let err = fx.engine.cancel_booking(b.id, Some(actor)).await.unwrap_err();
        assert_eq!(lifecycle_of(err), LifecycleRule::AlreadyCancelled);
    }
}

#[tokio::test]
async fn cancelled_is_terminal() {
    let fx = Fixture::new("cancel_terminal.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    fx.engine.cancel_booking(b.id, Some(&fx.admin)).await.unwrap();

    let err = fx.engine.confirm_booking(b.id, Some(&fx.admin)).await.unwrap_err();
    assert_eq!(lifecycle_of(err), LifecycleRule::CancelledImmutable);

    let draft = booking_draft(fx.alice.user_id, fx.room.id, day(), t(14, 0), t(15, 0));
    let err = fx.engine.update_booking(b.id, draft, Some(&fx.alice)).await.unwrap_err();
    assert_eq!(lifecycle_of(err), LifecycleRule::CancelledImmutable);
}

#[tokio::test]
async fn cancelling_frees_the_slot() {
    let fx = Fixture::new("cancel_frees.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(11, 0)).await.unwrap();
    assert!(fx.book(&fx.bob, t(10, 0), t(11, 0)).await.is_err());

    fx.engine.cancel_booking(b.id, Some(&fx.alice)).await.unwrap();
    fx.book(&fx.bob, t(10, 0), t(11, 0)).await.unwrap();

    let active = fx
        .engine
        .find_active_conflicts(fx.room.id, day(), None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].user_id, fx.bob.user_id);
}

// ── Updates ──────────────────────────────────────────────

#[tokio::test]
async fn update_excludes_itself_from_conflicts() {
    let fx = Fixture::new("update_self.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(11, 0)).await.unwrap();
    fx.clock.advance(TimeDelta::minutes(1));

    let draft = booking_draft(fx.alice.user_id, fx.room.id, day(), t(10, 0), t(12, 0));
    let updated = fx.engine.update_booking(b.id, draft, Some(&fx.alice)).await.unwrap();
    assert_eq!(updated.id, b.id);
    assert_eq!(updated.slot, TimeSlot::new(t(10, 0), t(12, 0)));
    assert_eq!(updated.created_at, b.created_at);
    assert!(updated.modified_at > b.modified_at);
    assert_eq!(updated.status, BookingStatus::Pending);
}

#[tokio::test]
async fn update_into_conflict_rejected() {
    let fx = Fixture::new("update_conflict.wal").await;
    let a = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    let b = fx.book(&fx.bob, t(10, 0), t(11, 0)).await.unwrap();

    let draft = booking_draft(fx.alice.user_id, fx.room.id, day(), t(9, 0), t(10, 30));
    let err = fx.engine.update_booking(a.id, draft, Some(&fx.alice)).await.unwrap_err();
    match err {
        EngineError::Validation(v) => {
            assert_eq!(v.rule, ValidationRule::ScheduleConflict);
            assert_eq!(v.conflicting.unwrap().booking_id, b.id);
        }
        other => panic!("unexpected {other:?}"),
    }
    // Unchanged after the rejected edit.
    assert_eq!(fx.engine.get_booking(a.id).await.unwrap().slot, a.slot);
}

#[tokio::test]
async fn update_moves_between_rooms_and_dates() {
    let fx = Fixture::new("update_move.wal").await;
    let other = fx
        .engine
        .create_room(room_draft("B-202", 4), Some(&fx.admin))
        .await
        .unwrap();
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    let tomorrow = day().succ_opt().unwrap();

    let draft = booking_draft(fx.alice.user_id, other.id, tomorrow, t(9, 0), t(10, 0));
    let moved = fx.engine.update_booking(b.id, draft, Some(&fx.alice)).await.unwrap();
    assert_eq!(moved.room_id, other.id);
    assert_eq!(moved.date, tomorrow);

    assert!(fx.engine.room_bookings(fx.room.id).await.unwrap().is_empty());
    assert_eq!(fx.engine.room_bookings(other.id).await.unwrap(), vec![moved.clone()]);
    assert_eq!(fx.engine.locate_booking(&b.id), Some((other.id, tomorrow)));

    // The old slot is free again.
    fx.book(&fx.bob, t(9, 0), t(10, 0)).await.unwrap();

    // And the move survives a restart.
    let engine2 = fx.reopen();
    assert_eq!(engine2.get_booking(b.id).await.unwrap(), moved);
}

#[tokio::test]
async fn regular_user_cannot_reassign_or_edit_others() {
    let fx = Fixture::new("update_owner.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();

    let draft = booking_draft(fx.bob.user_id, fx.room.id, day(), t(9, 0), t(10, 0));
    let err = fx.engine.update_booking(b.id, draft.clone(), Some(&fx.alice)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotOwner);

    let err = fx.engine.update_booking(b.id, draft.clone(), Some(&fx.bob)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotOwner);

    let reassigned = fx.engine.update_booking(b.id, draft, Some(&fx.admin)).await.unwrap();
    assert_eq!(reassigned.user_id, fx.bob.user_id);
}

#[tokio::test]
async fn delete_booking_owner_or_admin() {
    let fx = Fixture::new("delete_booking.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();

    let err = fx.engine.delete_booking(b.id, Some(&fx.bob)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotOwner);

    fx.engine.delete_booking(b.id, Some(&fx.alice)).await.unwrap();
    let err = fx.engine.get_booking(b.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::Booking, .. }));
    let err = fx.engine.delete_booking(b.id, Some(&fx.admin)).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_exactly_one() {
    let fx = Fixture::new("concurrent_overlap.wal").await;
    let mut users = Vec::new();
    for i in 0..16 {
        let u = fx
            .engine
            .register_user(user_draft("Racer", &format!("racer{i}@example.com")), Some(&fx.admin))
            .await
            .unwrap();
        users.push(Actor::from(&u));
    }

    let mut handles = Vec::new();
    for (i, actor) in users.into_iter().enumerate() {
        let engine = fx.engine.clone();
        let room = fx.room.id;
        // Staggered starts, every pair overlaps.
        let start = t(9, i as u32);
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(booking_draft(actor.user_id, room, day(), start, t(11, 0)), Some(&actor))
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(rule_of(e), ValidationRule::ScheduleConflict),
        }
    }
    assert_eq!(ok, 1);
    let active = fx
        .engine
        .find_active_conflicts(fx.room.id, day(), None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_creates_all_succeed() {
    let fx = Fixture::new("concurrent_disjoint.wal").await;
    let mut handles = Vec::new();
    for h in 8..22 {
        let engine = fx.engine.clone();
        let alice = fx.alice;
        let room = fx.room.id;
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(booking_draft(alice.user_id, room, day(), t(h, 0), t(h + 1, 0)), Some(&alice))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(fx.engine.room_bookings(fx.room.id).await.unwrap().len(), 14);

    let engine2 = fx.reopen();
    assert_eq!(engine2.booking_count(), 14);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_one_wins() {
    let fx = Fixture::new("concurrent_cancel.wal").await;
    let id = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap().id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = fx.engine.clone();
        let admin = fx.admin;
        handles.push(tokio::spawn(async move { engine.cancel_booking(id, Some(&admin)).await }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(lifecycle_of(e), LifecycleRule::AlreadyCancelled),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_moves_and_creates_admit_exactly_one() {
    let fx = Fixture::new("concurrent_moves.wal").await;
    let b202 = fx
        .engine
        .create_room(room_draft("B-202", 6), Some(&fx.admin))
        .await
        .unwrap();

    // Alice holds four disjoint slots in A-101; each races to move into
    // the same B-202 slot while Bob tries to create it directly.
    let mut movers = Vec::new();
    for h in [8, 10, 12, 14] {
        movers.push(fx.book(&fx.alice, t(h, 0), t(h + 1, 0)).await.unwrap().id);
    }

    let mut handles = Vec::new();
    for id in movers {
        let engine = fx.engine.clone();
        let alice = fx.alice;
        let target = b202.id;
        handles.push(tokio::spawn(async move {
            engine
                .update_booking(id, booking_draft(alice.user_id, target, day(), t(15, 0), t(17, 0)), Some(&alice))
                .await
        }));
    }
    for i in 0..4 {
        let engine = fx.engine.clone();
        let bob = fx.bob;
        let target = b202.id;
        // 15:30-17:30, 15:15-17:15, ... all overlap 15:00-17:00.
        let start = t(15, 30 - i * 5);
        let end = t(17, 30 - i * 5);
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(booking_draft(bob.user_id, target, day(), start, end), Some(&bob))
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(rule_of(e), ValidationRule::ScheduleConflict),
        }
    }
    assert_eq!(ok, 1);
    let active = fx
        .engine
        .find_active_conflicts(b202.id, day(), None)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    // Losing moves stay where they were.
    let moved = usize::from(active[0].user_id == fx.alice.user_id);
    assert_eq!(fx.engine.room_bookings(fx.room.id).await.unwrap().len(), 4 - moved);

    let engine2 = fx.reopen();
    assert_eq!(engine2.find_active_conflicts(b202.id, day(), None).await.unwrap(), active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crossing_moves_do_not_deadlock() {
    let fx = Fixture::new("crossing_moves.wal").await;
    let b202 = fx
        .engine
        .create_room(room_draft("B-202", 6), Some(&fx.admin))
        .await
        .unwrap();

    let mut moves = Vec::new();
    for h in 8..14 {
        let in_a = fx.book(&fx.alice, t(h, 0), t(h + 1, 0)).await.unwrap();
        let in_b = fx
            .engine
            .create_booking(
                booking_draft(fx.bob.user_id, b202.id, day(), t(h, 0), t(h + 1, 0)),
                Some(&fx.bob),
            )
            .await
            .unwrap();
        // A to B lands in the afternoon of B; B to A in the afternoon of A.
        moves.push((fx.alice, in_a.id, b202.id, h + 6));
        moves.push((fx.bob, in_b.id, fx.room.id, h + 6));
    }

    let mut handles = Vec::new();
    for (actor, id, target, h) in moves {
        let engine = fx.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .update_booking(id, booking_draft(actor.user_id, target, day(), t(h, 0), t(h + 1, 0)), Some(&actor))
                .await
        }));
    }

    let all = async {
        for h in handles {
            h.await.unwrap().unwrap();
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), all)
        .await
        .expect("crossing moves deadlocked");

    let in_a = fx.engine.room_bookings(fx.room.id).await.unwrap();
    let in_b = fx.engine.room_bookings(b202.id).await.unwrap();
    assert_eq!(in_a.len(), 6);
    assert_eq!(in_b.len(), 6);
    assert!(in_a.iter().all(|b| b.user_id == fx.bob.user_id));
    assert!(in_b.iter().all(|b| b.user_id == fx.alice.user_id));
}

// ── Listing ──────────────────────────────────────────────

#[tokio::test]
async fn list_bookings_ordered_and_filtered() {
    let fx = Fixture::new("list_bookings.wal").await;
    let tomorrow = day().succ_opt().unwrap();
    let a = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    let b = fx.book(&fx.bob, t(14, 0), t(15, 0)).await.unwrap();
    let c = fx
        .engine
        .create_booking(
            booking_draft(fx.alice.user_id, fx.room.id, tomorrow, t(8, 0), t(9, 0)),
            Some(&fx.alice),
        )
        .await
        .unwrap();
    fx.engine.confirm_booking(b.id, Some(&fx.admin)).await.unwrap();

    let all: Vec<Ulid> = fx
        .engine
        .list_bookings(&BookingFilter::default())
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(all, vec![c.id, b.id, a.id]);

    let alice_today = fx
        .engine
        .list_bookings(&BookingFilter {
            date: Some(day()),
            user_id: Some(fx.alice.user_id),
            ..Default::default()
        })
        .await;
    assert_eq!(alice_today.len(), 1);
    assert_eq!(alice_today[0].id, a.id);

    let today: Vec<Ulid> = fx.engine.bookings_for_today().await.into_iter().map(|b| b.id).collect();
    assert_eq!(today, vec![b.id, a.id]);

    let pending: Vec<Ulid> = fx.engine.pending_bookings().await.into_iter().map(|b| b.id).collect();
    assert_eq!(pending, vec![c.id, a.id]);

    assert_eq!(fx.engine.user_bookings(fx.bob.user_id).await.unwrap().len(), 1);
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn room_fields_validated() {
    let fx = Fixture::new("room_fields.wal").await;
    let admin = Some(&fx.admin);

    let err = fx.engine.create_room(room_draft("A-101", 4), admin).await.unwrap_err();
    assert!(matches!(err, EngineError::Duplicate { field: "name", .. }));
    let err = fx.engine.create_room(room_draft("Z", 0), admin).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidField { field: "capacity", .. }));
    let err = fx.engine.create_room(room_draft("Z", 101), admin).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidField { field: "capacity", .. }));
    let err = fx.engine.create_room(room_draft(&"n".repeat(51), 4), admin).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidField { field: "name", .. }));

    let err = fx.engine.create_room(room_draft("Z", 4), Some(&fx.alice)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotAdmin);
}

#[tokio::test]
async fn rename_frees_old_name() {
    let fx = Fixture::new("room_rename.wal").await;
    fx.engine
        .update_room(fx.room.id, room_draft("A-102", 8), Some(&fx.admin))
        .await
        .unwrap();
    fx.engine
        .create_room(room_draft("A-101", 2), Some(&fx.admin))
        .await
        .unwrap();
    assert_eq!(fx.engine.get_room(fx.room.id).await.unwrap().name, "A-102");

    let engine2 = fx.reopen();
    assert_eq!(engine2.room_count(), 2);
}

#[tokio::test]
async fn list_rooms_by_name_and_capacity() {
    let fx = Fixture::new("list_rooms.wal").await;
    let admin = Some(&fx.admin);
    fx.engine.create_room(room_draft("C-303", 20), admin).await.unwrap();
    let mut draft = room_draft("B-202", 12);
    draft.status = RoomStatus::Maintenance;
    fx.engine.create_room(draft, admin).await.unwrap();

    let names: Vec<String> = fx
        .engine
        .list_rooms(&RoomFilter::default())
        .await
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["A-101", "B-202", "C-303"]);

    let big: Vec<String> = fx
        .engine
        .list_rooms(&RoomFilter {
            available_only: false,
            min_capacity: Some(10),
        })
        .await
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(big, vec!["C-303"]);
}

#[tokio::test]
async fn delete_room_cascades() {
    let fx = Fixture::new("delete_room.wal").await;
    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    let mut rx = fx.engine.notify.subscribe(fx.room.id);

    fx.engine.delete_room(fx.room.id, Some(&fx.admin)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Event::RoomDeleted { id: fx.room.id });

    assert!(fx.engine.get_room(fx.room.id).await.is_err());
    assert!(fx.engine.get_booking(b.id).await.is_err());
    assert_eq!(fx.engine.booking_count(), 0);
    // Name is reusable.
    fx.engine.create_room(room_draft("A-101", 8), Some(&fx.admin)).await.unwrap();

    let engine2 = fx.reopen();
    assert_eq!(engine2.booking_count(), 0);
    assert_eq!(engine2.room_count(), 1);
}

// ── Users ────────────────────────────────────────────────

#[tokio::test]
async fn user_registration_rules() {
    let fx = Fixture::new("user_rules.wal").await;
    let admin = Some(&fx.admin);

    let err = fx
        .engine
        .register_user(user_draft("Al", "ALICE@example.com"), admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Duplicate { field: "email", .. }));

    let err = fx.engine.register_user(user_draft("Al", "nope"), admin).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidField { field: "email", .. }));

    let mut draft = user_draft("Al", "al@example.com");
    draft.phone = "0".repeat(16);
    let err = fx.engine.register_user(draft, admin).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidField { field: "phone", .. }));

    let err = fx
        .engine
        .register_user(user_draft("Al", "al@example.com"), Some(&fx.alice))
        .await
        .unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotAdmin);

    let found = fx.engine.find_user_by_email("  Alice@Example.COM ").unwrap();
    assert_eq!(found.id, fx.alice.user_id);
}

#[tokio::test]
async fn users_edit_own_profile_but_not_role() {
    let fx = Fixture::new("user_update.wal").await;
    let before = fx.engine.get_user(fx.alice.user_id).unwrap();

    let mut draft = user_draft("Alice B.", "alice.b@example.com");
    draft.affiliation = "Design".into();
    fx.clock.advance(TimeDelta::hours(1));
    let updated = fx
        .engine
        .update_user(fx.alice.user_id, draft.clone(), Some(&fx.alice))
        .await
        .unwrap();
    assert_eq!(updated.email, "alice.b@example.com");
    assert_eq!(updated.registered_at, before.registered_at);
    assert!(fx.engine.find_user_by_email("alice@example.com").is_none());

    let err = fx
        .engine
        .update_user(fx.alice.user_id, draft.clone(), Some(&fx.bob))
        .await
        .unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotOwner);

    draft.role = Role::Admin;
    let err = fx
        .engine
        .update_user(fx.alice.user_id, draft.clone(), Some(&fx.alice))
        .await
        .unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotAdmin);

    let promoted = fx
        .engine
        .update_user(fx.alice.user_id, draft, Some(&fx.admin))
        .await
        .unwrap();
    assert!(promoted.is_admin());

    let err = fx
        .engine
        .update_user(fx.alice.user_id, user_draft("Alice", "BOB@example.com"), Some(&fx.admin))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Duplicate { field: "email", .. }));
}

#[tokio::test]
async fn delete_user_cascades() {
    let fx = Fixture::new("delete_user.wal").await;
    let other = fx
        .engine
        .create_room(room_draft("B-202", 4), Some(&fx.admin))
        .await
        .unwrap();
    fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    fx.engine
        .create_booking(
            booking_draft(fx.alice.user_id, other.id, day(), t(9, 0), t(10, 0)),
            Some(&fx.alice),
        )
        .await
        .unwrap();
    let kept = fx.book(&fx.bob, t(12, 0), t(13, 0)).await.unwrap();

    let err = fx.engine.delete_user(fx.alice.user_id, Some(&fx.bob)).await.unwrap_err();
    assert_eq!(auth_of(err), AuthError::NotAdmin);

    fx.engine.delete_user(fx.alice.user_id, Some(&fx.admin)).await.unwrap();
    assert!(fx.engine.get_user(fx.alice.user_id).is_err());
    assert!(fx.engine.find_user_by_email("alice@example.com").is_none());
    let left: Vec<Ulid> = fx
        .engine
        .list_bookings(&BookingFilter::default())
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(left, vec![kept.id]);

    // A deleted user can no longer book.
    let err = fx.book(&fx.alice, t(15, 0), t(16, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::User, .. }));

    let engine2 = fx.reopen();
    assert_eq!(engine2.booking_count(), 1);
    assert!(engine2.find_user_by_email("alice@example.com").is_none());
}

#[tokio::test]
async fn bootstrap_admin_is_idempotent() {
    let fx = Fixture::new("bootstrap.wal").await;
    let again = fx.engine.bootstrap_admin("ADMIN@example.com", "Other").await.unwrap();
    assert!(again.is_none());
    assert_eq!(fx.engine.list_users().len(), 3);
}

#[tokio::test]
async fn list_users_newest_first() {
    let fx = Fixture::new("list_users.wal").await;
    fx.clock.advance(TimeDelta::minutes(1));
    let carol = fx
        .engine
        .register_user(user_draft("Carol", "carol@example.com"), Some(&fx.admin))
        .await
        .unwrap();
    let users = fx.engine.list_users();
    assert_eq!(users[0].id, carol.id);
    assert_eq!(users.len(), 4);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let fx = Fixture::new("restart.wal").await;
    let a = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    let b = fx.book(&fx.bob, t(10, 0), t(11, 0)).await.unwrap();
    fx.engine.confirm_booking(a.id, Some(&fx.admin)).await.unwrap();
    fx.engine.cancel_booking(b.id, Some(&fx.bob)).await.unwrap();

    let engine2 = fx.reopen();
    assert_eq!(engine2.get_booking(a.id).await.unwrap().status, BookingStatus::Confirmed);
    assert_eq!(engine2.get_booking(b.id).await.unwrap().status, BookingStatus::Cancelled);
    assert_eq!(engine2.list_users().len(), 3);
    assert_eq!(engine2.get_room(fx.room.id).await.unwrap(), fx.room);

    // Replayed state enforces the same rules.
    let err = engine2
        .create_booking(
            booking_draft(fx.bob.user_id, fx.room.id, day(), t(9, 30), t(10, 30)),
            Some(&fx.bob),
        )
        .await
        .unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::ScheduleConflict);
}

#[tokio::test]
async fn bookings_after_a_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let fx = Fixture::new("torn_restart.wal").await;
    let a = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&fx.path).unwrap();
        f.write_all(&[0xAB; 6]).unwrap();
    }

    let engine2 = fx.reopen();
    assert!(engine2.get_booking(a.id).await.is_ok());
    let b = engine2
        .create_booking(
            booking_draft(fx.bob.user_id, fx.room.id, day(), t(10, 0), t(11, 0)),
            Some(&fx.bob),
        )
        .await
        .unwrap();
    engine2.confirm_booking(b.id, Some(&fx.admin)).await.unwrap();
    drop(engine2);

    let engine3 = fx.reopen();
    assert!(engine3.get_booking(a.id).await.is_ok());
    assert_eq!(engine3.get_booking(b.id).await.unwrap().status, BookingStatus::Confirmed);
    let err = engine3
        .create_booking(
            booking_draft(fx.alice.user_id, fx.room.id, day(), t(10, 30), t(11, 30)),
            Some(&fx.alice),
        )
        .await
        .unwrap_err();
    assert_eq!(rule_of(err), ValidationRule::ScheduleConflict);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let fx = Fixture::new("compact.wal").await;
    let a = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    fx.engine.confirm_booking(a.id, Some(&fx.admin)).await.unwrap();
    let b = fx.book(&fx.bob, t(12, 0), t(13, 0)).await.unwrap();
    fx.engine.delete_booking(b.id, Some(&fx.bob)).await.unwrap();
    assert!(fx.engine.wal_appends_since_compact().await > 0);

    fx.engine.compact_wal().await.unwrap();
    assert_eq!(fx.engine.wal_appends_since_compact().await, 0);

    // Writes after compaction land in the new log.
    let c = fx.book(&fx.bob, t(14, 0), t(15, 0)).await.unwrap();

    let engine2 = fx.reopen();
    assert_eq!(engine2.get_booking(a.id).await.unwrap().status, BookingStatus::Confirmed);
    assert!(engine2.get_booking(b.id).await.is_err());
    assert_eq!(engine2.get_booking(c.id).await.unwrap(), c);
    assert_eq!(engine2.list_users().len(), 3);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let fx = Fixture::new("group_commit.wal").await;
    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = fx.engine.clone();
        let admin = fx.admin;
        handles.push(tokio::spawn(async move {
            engine
                .create_room(room_draft(&format!("R-{i}"), 4), Some(&admin))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(fx.engine.room_count(), n + 1);

    let engine2 = fx.reopen();
    assert_eq!(engine2.room_count(), n + 1);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn room_listeners_see_booking_events() {
    let fx = Fixture::new("notify.wal").await;
    let mut rx = fx.engine.notify.subscribe(fx.room.id);

    let b = fx.book(&fx.alice, t(9, 0), t(10, 0)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Event::BookingCreated { booking: b.clone() });

    fx.engine.confirm_booking(b.id, Some(&fx.admin)).await.unwrap();
    match rx.recv().await.unwrap() {
        Event::BookingStatusChanged { id, status, .. } => {
            assert_eq!(id, b.id);
            assert_eq!(status, BookingStatus::Confirmed);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Rejections publish nothing.
    assert!(fx.book(&fx.bob, t(9, 0), t(10, 0)).await.is_err());
    assert!(rx.try_recv().is_err());
}

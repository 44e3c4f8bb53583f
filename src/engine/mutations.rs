use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_REJECTED_TOTAL, BOOKING_TRANSITIONS_TOTAL};
use crate::policy::{authorize, Operation};

use super::validate::{check_reason, check_room_draft, check_user_draft, email_key, name_key};
use super::{transition, validate, Engine, EngineError, Entity, Transition};

fn rejected(op: &'static str, err: EngineError) -> EngineError {
    if err.is_rejection() {
        debug!(op, code = err.code(), "rejected: {err}");
        metrics::counter!(BOOKINGS_REJECTED_TOTAL, "code" => err.code()).increment(1);
    }
    err
}

impl Engine {
    // ── Bookings ─────────────────────────────────────────

    /// Validate and store a new booking, `pending` unless the draft asks for
    /// direct confirmation.
    pub async fn create_booking(
        &self,
        draft: BookingDraft,
        actor: Option<&Actor>,
    ) -> Result<Booking, EngineError> {
        self.create_booking_inner(draft, actor)
            .await
            .map_err(|e| rejected("create_booking", e))
    }

    async fn create_booking_inner(
        &self,
        draft: BookingDraft,
        actor: Option<&Actor>,
    ) -> Result<Booking, EngineError> {
        authorize(actor, Operation::CreateBooking, Some(draft.user_id))?;
        if draft.direct_confirm {
            authorize(actor, Operation::ConfirmBooking, None)?;
        }
        check_reason(&draft.reason)?;

        let rs = self
            .get_room_state(&draft.room_id)
            .ok_or(EngineError::not_found(Entity::Room, draft.room_id))?;
        let mut guard = rs.write_owned().await;
        self.ensure_room_live(&guard)?;
        // Under the room lock so a concurrent delete_user cannot slip past.
        if !self.users.contains_key(&draft.user_id) {
            return Err(EngineError::not_found(Entity::User, draft.user_id));
        }
        if guard.booking_count() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }

        let today = self.clock.today();
        let date = draft.date;
        let draft = validate(draft, guard.bookings_on(date), &guard.room, today, None)?.into_draft();

        let now = self.clock.now();
        let booking = Booking {
            id: Ulid::new(),
            user_id: draft.user_id,
            room_id: draft.room_id,
            date: draft.date,
            slot: draft.slot(),
            status: if draft.direct_confirm {
                BookingStatus::Confirmed
            } else {
                BookingStatus::Pending
            },
            reason: draft.reason,
            created_at: now,
            modified_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %booking.id, room = %booking.room_id, date = %booking.date, slot = %booking.slot, status = %booking.status, "booking created");
        Ok(booking)
    }

    /// Replace a booking's editable fields. The booking keeps its id, status
    /// and creation time; it may move to another room or date. `direct_confirm`
    /// only applies at creation.
    pub async fn update_booking(
        &self,
        id: Ulid,
        draft: BookingDraft,
        actor: Option<&Actor>,
    ) -> Result<Booking, EngineError> {
        self.update_booking_inner(id, draft, actor)
            .await
            .map_err(|e| rejected("update_booking", e))
    }

    async fn update_booking_inner(
        &self,
        id: Ulid,
        draft: BookingDraft,
        actor: Option<&Actor>,
    ) -> Result<Booking, EngineError> {
        let (date, mut source, mut target) = self.lock_for_move(id, draft.room_id).await?;
        let existing = source
            .booking(id, date)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Booking, id))?;

        authorize(actor, Operation::UpdateBooking, Some(existing.user_id))?;
        if draft.user_id != existing.user_id {
            authorize(actor, Operation::UpdateBooking, Some(draft.user_id))?;
        }
        let status = transition(existing.status, Transition::Update)?;
        check_reason(&draft.reason)?;
        if !self.users.contains_key(&draft.user_id) {
            return Err(EngineError::not_found(Entity::User, draft.user_id));
        }

        let today = self.clock.today();
        let draft = {
            let room_state = target.as_deref().unwrap_or(&*source);
            self.ensure_room_live(room_state)?;
            validate(
                draft.clone(),
                room_state.bookings_on(draft.date),
                &room_state.room,
                today,
                Some(id),
            )?
            .into_draft()
        };

        let booking = Booking {
            id,
            user_id: draft.user_id,
            room_id: draft.room_id,
            date: draft.date,
            slot: draft.slot(),
            status,
            reason: draft.reason,
            created_at: existing.created_at,
            modified_at: self.clock.now(),
        };
        match target.as_mut() {
            Some(target) => {
                self.persist_relocation(&mut source, target, &booking)
                    .await?
            }
            None => {
                let event = Event::BookingUpdated {
                    booking: booking.clone(),
                };
                self.persist_and_apply(&mut source, &event).await?
            }
        }
        info!(booking = %id, room = %booking.room_id, date = %booking.date, slot = %booking.slot, "booking updated");
        Ok(booking)
    }

    /// Lock the room holding `id` and, when different, `target_room`, in id order.
    /// Returns the booking's current date, its room's guard, and the target's.
    async fn lock_for_move(
        &self,
        id: Ulid,
        target_room: Ulid,
    ) -> Result<
        (
            NaiveDate,
            OwnedRwLockWriteGuard<RoomState>,
            Option<OwnedRwLockWriteGuard<RoomState>>,
        ),
        EngineError,
    > {
        loop {
            let (source_id, date) = self
                .locate_booking(&id)
                .ok_or(EngineError::not_found(Entity::Booking, id))?;
            if source_id == target_room {
                let (date, guard) = self.resolve_booking_write(id).await?;
                if guard.room.id == target_room {
                    return Ok((date, guard, None));
                }
                continue;
            }

            let source_rs = self
                .get_room_state(&source_id)
                .ok_or(EngineError::not_found(Entity::Booking, id))?;
            let target_rs = self
                .get_room_state(&target_room)
                .ok_or(EngineError::not_found(Entity::Room, target_room))?;
            let (source, target) = if source_id < target_room {
                let s = source_rs.write_owned().await;
                (s, target_rs.write_owned().await)
            } else {
                let t = target_rs.write_owned().await;
                (source_rs.write_owned().await, t)
            };
            // The index only changes under the room lock, so it is
            // authoritative now. Retry if the booking moved while we waited.
            match self.locate_booking(&id) {
                Some(found) if found == (source_id, date) => {
                    return Ok((date, source, Some(target)));
                }
                Some(_) => continue,
                None => return Err(EngineError::not_found(Entity::Booking, id)),
            }
        }
    }

    /// Admin approval: `pending → confirmed`.
    pub async fn confirm_booking(&self, id: Ulid, actor: Option<&Actor>) -> Result<Booking, EngineError> {
        self.change_status(id, actor, Transition::Confirm)
            .await
            .map_err(|e| rejected("confirm_booking", e))
    }

    /// Owner or admin cancellation. Cancelled bookings stay on record but
    /// never block a slot again.
    pub async fn cancel_booking(&self, id: Ulid, actor: Option<&Actor>) -> Result<Booking, EngineError> {
        self.change_status(id, actor, Transition::Cancel)
            .await
            .map_err(|e| rejected("cancel_booking", e))
    }

    async fn change_status(
        &self,
        id: Ulid,
        actor: Option<&Actor>,
        attempted: Transition,
    ) -> Result<Booking, EngineError> {
        let (date, mut guard) = self.resolve_booking_write(id).await?;
        let current = guard
            .booking(id, date)
            .ok_or(EngineError::not_found(Entity::Booking, id))?;
        let op = match attempted {
            Transition::Confirm => Operation::ConfirmBooking,
            _ => Operation::CancelBooking,
        };
        authorize(actor, op, Some(current.user_id))?;
        let status = transition(current.status, attempted)?;

        let event = Event::BookingStatusChanged {
            id,
            room_id: guard.room.id,
            status,
            at: self.clock.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "transition" => transition_label(attempted))
            .increment(1);
        info!(booking = %id, %status, "booking status changed");
        guard
            .booking(id, date)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Booking, id))
    }

    /// Hard delete, owner or admin.
    pub async fn delete_booking(&self, id: Ulid, actor: Option<&Actor>) -> Result<(), EngineError> {
        self.delete_booking_inner(id, actor)
            .await
            .map_err(|e| rejected("delete_booking", e))?;
        info!(booking = %id, "booking deleted");
        Ok(())
    }

    async fn delete_booking_inner(&self, id: Ulid, actor: Option<&Actor>) -> Result<(), EngineError> {
        let (date, mut guard) = self.resolve_booking_write(id).await?;
        let owner = guard
            .booking(id, date)
            .map(|b| b.user_id)
            .ok_or(EngineError::not_found(Entity::Booking, id))?;
        authorize(actor, Operation::DeleteBooking, Some(owner))?;
        let event = Event::BookingDeleted {
            id,
            room_id: guard.room.id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// A room whose state was removed from the map after we looked it up.
    fn ensure_room_live(&self, rs: &RoomState) -> Result<(), EngineError> {
        if self.rooms.contains_key(&rs.room.id) {
            Ok(())
        } else {
            Err(EngineError::not_found(Entity::Room, rs.room.id))
        }
    }

    // ── Rooms ────────────────────────────────────────────

    pub async fn create_room(&self, draft: RoomDraft, actor: Option<&Actor>) -> Result<Room, EngineError> {
        authorize(actor, Operation::WriteRoom, None)?;
        check_room_draft(&draft)?;

        let _directory = self.directory.lock().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.room_names.contains_key(&name_key(&draft.name)) {
            return Err(EngineError::Duplicate {
                field: "name",
                value: draft.name,
            });
        }

        let room = draft.into_room(Ulid::new());
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.install_room(room.clone());
        self.notify.send(room.id, &event);
        info!(room = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    /// Replace a room's fields. Existing bookings are left as they are, even
    /// when the room goes into maintenance.
    pub async fn update_room(
        &self,
        id: Ulid,
        draft: RoomDraft,
        actor: Option<&Actor>,
    ) -> Result<Room, EngineError> {
        authorize(actor, Operation::WriteRoom, None)?;
        check_room_draft(&draft)?;

        let _directory = self.directory.lock().await;
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::not_found(Entity::Room, id))?;
        if let Some(holder) = self.room_names.get(&name_key(&draft.name)).map(|e| *e.value())
            && holder != id
        {
            return Err(EngineError::Duplicate {
                field: "name",
                value: draft.name,
            });
        }

        let mut guard = rs.write().await;
        let room = draft.into_room(id);
        let old_name = guard.room.name.clone();
        let event = Event::RoomUpdated { room: room.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        self.rename_room(&old_name, &room);
        info!(room = %id, status = %room.status, "room updated");
        Ok(room)
    }

    /// Remove a room together with all of its bookings.
    pub async fn delete_room(&self, id: Ulid, actor: Option<&Actor>) -> Result<(), EngineError> {
        authorize(actor, Operation::WriteRoom, None)?;

        let _directory = self.directory.lock().await;
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::not_found(Entity::Room, id))?;
        let guard = rs.write().await;
        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        let cascaded = guard.booking_count();
        self.forget_room(&guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(room = %id, cascaded, "room deleted");
        Ok(())
    }

    // ── Users ────────────────────────────────────────────

    pub async fn register_user(&self, draft: UserDraft, actor: Option<&Actor>) -> Result<User, EngineError> {
        authorize(actor, Operation::WriteUser, None)?;
        self.insert_user(draft).await
    }

    /// Seed an admin at startup. Does nothing if the email is already taken.
    pub async fn bootstrap_admin(&self, email: &str, name: &str) -> Result<Option<User>, EngineError> {
        if self.emails.contains_key(&email_key(email)) {
            return Ok(None);
        }
        let draft = UserDraft {
            name: name.to_string(),
            email: email.to_string(),
            phone: String::new(),
            affiliation: String::new(),
            role: Role::Admin,
        };
        match self.insert_user(draft).await {
            Ok(user) => Ok(Some(user)),
            Err(EngineError::Duplicate { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert_user(&self, draft: UserDraft) -> Result<User, EngineError> {
        check_user_draft(&draft)?;

        let _directory = self.directory.lock().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.emails.contains_key(&email_key(&draft.email)) {
            return Err(EngineError::Duplicate {
                field: "email",
                value: draft.email,
            });
        }

        let user = User {
            id: Ulid::new(),
            name: draft.name,
            email: draft.email.trim().to_string(),
            phone: draft.phone,
            affiliation: draft.affiliation,
            role: draft.role,
            registered_at: self.clock.now(),
        };
        self.wal_append(&Event::UserRegistered { user: user.clone() })
            .await?;
        self.install_user(user.clone());
        info!(user = %user.id, role = ?user.role, "user registered");
        Ok(user)
    }

    /// Owners may edit their own profile; only admins may change a role.
    pub async fn update_user(
        &self,
        id: Ulid,
        draft: UserDraft,
        actor: Option<&Actor>,
    ) -> Result<User, EngineError> {
        authorize(actor, Operation::UpdateUser, Some(id))?;
        check_user_draft(&draft)?;

        let _directory = self.directory.lock().await;
        let current = self
            .users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::not_found(Entity::User, id))?;
        if draft.role != current.role {
            authorize(actor, Operation::WriteUser, None)?;
        }
        if let Some(holder) = self.emails.get(&email_key(&draft.email)).map(|e| *e.value())
            && holder != id
        {
            return Err(EngineError::Duplicate {
                field: "email",
                value: draft.email,
            });
        }

        let user = User {
            id,
            name: draft.name,
            email: draft.email.trim().to_string(),
            phone: draft.phone,
            affiliation: draft.affiliation,
            role: draft.role,
            registered_at: current.registered_at,
        };
        self.wal_append(&Event::UserUpdated { user: user.clone() })
            .await?;
        self.install_user(user.clone());
        info!(user = %id, "user updated");
        Ok(user)
    }

    /// Remove a user together with all of their bookings.
    pub async fn delete_user(&self, id: Ulid, actor: Option<&Actor>) -> Result<(), EngineError> {
        authorize(actor, Operation::WriteUser, None)?;

        let _directory = self.directory.lock().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::not_found(Entity::User, id));
        }
        let mut guards = Vec::new();
        for rs in self.room_states_sorted() {
            guards.push(rs.write_owned().await);
        }

        let event = Event::UserDeleted { id };
        self.wal_append(&event).await?;
        for guard in &mut guards {
            let before = guard.booking_count();
            self.strip_user(guard, id);
            if guard.booking_count() != before {
                self.notify.send(guard.room.id, &event);
            }
        }
        self.forget_user(id);
        info!(user = %id, "user deleted");
        Ok(())
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence that rebuilds current state.
    ///
    /// Holds the directory lock and every room's read lock until the writer
    /// has queued the compaction, so no write can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        let mut guards = Vec::new();
        for rs in self.room_states_sorted() {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|user| Event::UserRegistered { user }));
        for guard in &guards {
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            events.extend(guard.bookings().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn transition_label(t: Transition) -> &'static str {
    match t {
        Transition::Confirm => "confirm",
        Transition::Cancel => "cancel",
        Transition::Update => "update",
    }
}

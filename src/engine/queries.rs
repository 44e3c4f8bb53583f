use std::cmp::Reverse;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::validate::email_key;
use super::{Engine, EngineError, Entity};

/// Newest date first, latest start first within a date.
fn sort_bookings(bookings: &mut [Booking]) {
    bookings.sort_by_key(|b| Reverse((b.date, b.slot.start)));
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::not_found(Entity::Room, id))?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    /// Rooms matching `filter`, ordered by name.
    pub async fn list_rooms(&self, filter: &RoomFilter) -> Vec<Room> {
        let mut rooms = Vec::new();
        for rs in self.room_states_sorted() {
            let guard = rs.read().await;
            if filter.matches(&guard.room) {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    // ── Users ────────────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::not_found(Entity::User, id))
    }

    /// Case-insensitive lookup by login email.
    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        let id = self.emails.get(&email_key(email)).map(|e| *e.value())?;
        self.users.get(&id).map(|u| u.value().clone())
    }

    /// Most recently registered first.
    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| Reverse((u.registered_at, u.id)));
        users
    }

    // ── Bookings ─────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (room_id, date) = self
            .locate_booking(&id)
            .ok_or(EngineError::not_found(Entity::Booking, id))?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::not_found(Entity::Booking, id))?;
        let guard = rs.read().await;
        guard
            .booking(id, date)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Booking, id))
    }

    /// Pending and confirmed bookings of a room on a date, minus `exclude`.
    ///
    /// A snapshot: it may be stale by the time the caller acts on it. Writes
    /// re-check under the room's lock.
    pub async fn find_active_conflicts(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::not_found(Entity::Room, room_id))?;
        let guard = rs.read().await;
        Ok(guard.active_on(date, exclude).cloned().collect())
    }

    /// All bookings matching every set field of `filter`, newest first.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let states = match filter.room_id {
            Some(room_id) => self.get_room_state(&room_id).into_iter().collect(),
            None => self.room_states_sorted(),
        };
        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            match filter.date {
                Some(date) => out.extend(guard.bookings_on(date).iter().filter(|b| filter.matches(b)).cloned()),
                None => out.extend(guard.bookings().filter(|b| filter.matches(b)).cloned()),
            }
        }
        sort_bookings(&mut out);
        out
    }

    pub async fn room_bookings(&self, room_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::not_found(Entity::Room, room_id));
        }
        Ok(self
            .list_bookings(&BookingFilter {
                room_id: Some(room_id),
                ..Default::default()
            })
            .await)
    }

    pub async fn user_bookings(&self, user_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::not_found(Entity::User, user_id));
        }
        Ok(self
            .list_bookings(&BookingFilter {
                user_id: Some(user_id),
                ..Default::default()
            })
            .await)
    }

    pub async fn bookings_for_today(&self) -> Vec<Booking> {
        self.list_bookings(&BookingFilter {
            date: Some(self.clock.today()),
            ..Default::default()
        })
        .await
    }

    pub async fn pending_bookings(&self) -> Vec<Booking> {
        self.list_bookings(&BookingFilter {
            status: Some(BookingStatus::Pending),
            ..Default::default()
        })
        .await
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn booking_count(&self) -> usize {
        self.booking_index.len()
    }
}

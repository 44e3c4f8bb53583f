use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Two slots conflict unless one ends at or before the other starts.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }

    pub fn hours(&self) -> f64 {
        let hours = self.duration().num_seconds() as f64 / 3600.0;
        (hours * 100.0).round() / 100.0
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Available,
    Maintenance,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomStatus::Available => f.write_str("available"),
            RoomStatus::Maintenance => f.write_str("maintenance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: String,
    pub equipment: String,
    pub status: RoomStatus,
    pub image_url: Option<String>,
}

impl Room {
    pub fn is_available(&self) -> bool {
        self.status == RoomStatus::Available
    }
}

/// Client-supplied room fields for create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDraft {
    pub name: String,
    pub capacity: u32,
    pub location: String,
    #[serde(default)]
    pub equipment: String,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl RoomDraft {
    pub fn into_room(self, id: Ulid) -> Room {
        Room {
            id,
            name: self.name,
            capacity: self.capacity,
            location: self.location,
            equipment: self.equipment,
            status: self.status,
            image_url: self.image_url,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomFilter {
    pub available_only: bool,
    /// Searching by capacity only ever returns available rooms.
    pub min_capacity: Option<u32>,
}

impl RoomFilter {
    pub fn matches(&self, room: &Room) -> bool {
        if (self.available_only || self.min_capacity.is_some()) && !room.is_available() {
            return false;
        }
        self.min_capacity.is_none_or(|min| room.capacity >= min)
    }
}

// ── Users ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Regular,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    /// Login identifier, unique case-insensitively.
    pub email: String,
    pub phone: String,
    pub affiliation: String,
    pub role: Role,
    pub registered_at: DateTime<Utc>,
}

impl User {
    /// The only place admin capability is derived.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDraft {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub role: Role,
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Ulid,
    pub admin: bool,
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            admin: user.is_admin(),
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// Pending and confirmed bookings occupy their slot.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingStatus::Pending => f.write_str("pending"),
            BookingStatus::Confirmed => f.write_str("confirmed"),
            BookingStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub status: BookingStatus,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// A proposed booking, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default)]
    pub reason: String,
    /// Create directly in `confirmed`. Admin only.
    #[serde(default)]
    pub direct_confirm: bool,
}

impl BookingDraft {
    pub fn slot(&self) -> TimeSlot {
        TimeSlot::new(self.start, self.end)
    }
}

/// All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingFilter {
    pub date: Option<NaiveDate>,
    pub status: Option<BookingStatus>,
    pub user_id: Option<Ulid>,
    pub room_id: Option<Ulid>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.date.is_none_or(|d| booking.date == d)
            && self.status.is_none_or(|s| booking.status == s)
            && self.user_id.is_none_or(|u| booking.user_id == u)
            && self.room_id.is_none_or(|r| booking.room_id == r)
    }
}

/// A room together with every booking that references it, grouped by date.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Per-date bookings sorted by `slot.start`. Cancelled bookings stay here.
    pub days: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            days: BTreeMap::new(),
        }
    }

    /// Insert booking maintaining sort order by slot start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.days.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.slot.start, |b| b.slot.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid, date: NaiveDate) -> Option<Booking> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    pub fn booking(&self, id: Ulid, date: NaiveDate) -> Option<&Booking> {
        self.days.get(&date)?.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid, date: NaiveDate) -> Option<&mut Booking> {
        self.days.get_mut(&date)?.iter_mut().find(|b| b.id == id)
    }

    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        self.days.get(&date).map_or(&[], |d| d.as_slice())
    }

    /// Active bookings on `date`, skipping `exclude`.
    pub fn active_on(
        &self,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &Booking> {
        self.bookings_on(date)
            .iter()
            .filter(move |b| b.is_active() && Some(b.id) != exclude)
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }

    pub fn booking_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        id: Ulid,
    },
    UserRegistered {
        user: User,
    },
    UserUpdated {
        user: User,
    },
    UserDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full record after an edit; may have moved to another room or date.
    BookingUpdated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
        at: DateTime<Utc>,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
}

use chrono::{NaiveTime, TimeDelta};

/// Earliest time of day a booking may start.
pub const OPENING_TIME: NaiveTime = match NaiveTime::from_hms_opt(8, 0, 0) {
    Some(t) => t,
    None => panic!("invalid opening time"),
};

/// Latest time of day a booking may end.
pub const CLOSING_TIME: NaiveTime = match NaiveTime::from_hms_opt(22, 0, 0) {
    Some(t) => t,
    None => panic!("invalid closing time"),
};

/// Longest single booking.
pub const MAX_BOOKING_DURATION: TimeDelta = TimeDelta::hours(4);

pub const MIN_ROOM_CAPACITY: u32 = 1;
pub const MAX_ROOM_CAPACITY: u32 = 100;

pub const MAX_ROOM_NAME_LEN: usize = 50;
pub const MAX_LOCATION_LEN: usize = 100;
pub const MAX_EQUIPMENT_LEN: usize = 2_000;
pub const MAX_IMAGE_URL_LEN: usize = 500;

pub const MAX_DISPLAY_NAME_LEN: usize = 150;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 15;
pub const MAX_AFFILIATION_LEN: usize = 100;

pub const MAX_REASON_LEN: usize = 500;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 1_000_000;

/// Longest accepted protocol line in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

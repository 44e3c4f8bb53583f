use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{ValidationError, ValidationRule};
use super::EngineError;

/// A draft that passed every booking rule against a particular snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBooking(BookingDraft);

impl ValidatedBooking {
    pub fn draft(&self) -> &BookingDraft {
        &self.0
    }

    pub fn into_draft(self) -> BookingDraft {
        self.0
    }
}

/// Check a draft against the booking rules, in order, stopping at the first failure.
///
/// `existing` may be any superset of the room's bookings on the draft's date;
/// other rooms, other dates, cancelled bookings and `exclude` are skipped here.
/// Touching slots (one ends exactly when the other starts) do not conflict.
pub fn validate<'a>(
    draft: BookingDraft,
    existing: impl IntoIterator<Item = &'a Booking>,
    room: &Room,
    today: NaiveDate,
    exclude: Option<Ulid>,
) -> Result<ValidatedBooking, ValidationError> {
    let slot = draft.slot();

    if slot.end <= slot.start {
        return Err(ValidationError::new(
            ValidationRule::InvalidInterval,
            "end time must be after start time",
        ));
    }
    if draft.date < today {
        return Err(ValidationError::new(
            ValidationRule::PastDate,
            "bookings cannot be made for past dates",
        ));
    }
    if !room.is_available() {
        return Err(ValidationError::new(
            ValidationRule::RoomUnavailable,
            format!("room {} is not available (status: {})", room.name, room.status),
        ));
    }
    if slot.start < OPENING_TIME || slot.end > CLOSING_TIME {
        return Err(ValidationError::new(
            ValidationRule::OutsideOperatingHours,
            format!(
                "bookings are allowed from {} to {}",
                OPENING_TIME.format("%H:%M"),
                CLOSING_TIME.format("%H:%M")
            ),
        ));
    }
    if slot.duration() > MAX_BOOKING_DURATION {
        return Err(ValidationError::new(
            ValidationRule::DurationExceeded,
            format!(
                "maximum booking duration is {} hours",
                MAX_BOOKING_DURATION.num_hours()
            ),
        ));
    }

    let clash = existing.into_iter().find(|b| {
        b.room_id == room.id
            && b.date == draft.date
            && b.is_active()
            && Some(b.id) != exclude
            && b.slot.overlaps(&slot)
    });
    if let Some(b) = clash {
        return Err(ValidationError::conflict(b.id, b.slot));
    }

    Ok(ValidatedBooking(draft))
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.chars().count() > max {
        return Err(EngineError::InvalidField {
            field,
            reason: "too long",
        });
    }
    Ok(())
}

fn check_present(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidField {
            field,
            reason: "must not be empty",
        });
    }
    Ok(())
}

pub(crate) fn check_room_draft(draft: &RoomDraft) -> Result<(), EngineError> {
    check_present("name", &draft.name)?;
    check_len("name", &draft.name, MAX_ROOM_NAME_LEN)?;
    if draft.capacity < MIN_ROOM_CAPACITY {
        return Err(EngineError::InvalidField {
            field: "capacity",
            reason: "must be greater than 0",
        });
    }
    if draft.capacity > MAX_ROOM_CAPACITY {
        return Err(EngineError::InvalidField {
            field: "capacity",
            reason: "must not exceed 100",
        });
    }
    check_len("location", &draft.location, MAX_LOCATION_LEN)?;
    check_len("equipment", &draft.equipment, MAX_EQUIPMENT_LEN)?;
    if let Some(url) = &draft.image_url {
        check_len("image_url", url, MAX_IMAGE_URL_LEN)?;
    }
    Ok(())
}

pub(crate) fn check_user_draft(draft: &UserDraft) -> Result<(), EngineError> {
    check_present("name", &draft.name)?;
    check_len("name", &draft.name, MAX_DISPLAY_NAME_LEN)?;
    check_present("email", &draft.email)?;
    check_len("email", &draft.email, MAX_EMAIL_LEN)?;
    if !draft.email.contains('@') {
        return Err(EngineError::InvalidField {
            field: "email",
            reason: "not an email address",
        });
    }
    check_len("phone", &draft.phone, MAX_PHONE_LEN)?;
    check_len("affiliation", &draft.affiliation, MAX_AFFILIATION_LEN)?;
    Ok(())
}

pub(crate) fn check_reason(reason: &str) -> Result<(), EngineError> {
    check_len("reason", reason, MAX_REASON_LEN)
}

/// Emails are compared case-insensitively.
pub(crate) fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Room names are unique ignoring surrounding whitespace.
pub(crate) fn name_key(name: &str) -> String {
    name.trim().to_string()
}

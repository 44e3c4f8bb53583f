use std::fmt;

use serde::Serialize;
use ulid::Ulid;

use crate::model::{BookingStatus, TimeSlot};

/// Which booking rule a draft broke. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    InvalidInterval,
    PastDate,
    RoomUnavailable,
    OutsideOperatingHours,
    DurationExceeded,
    ScheduleConflict,
}

impl ValidationRule {
    pub fn code(self) -> &'static str {
        match self {
            ValidationRule::InvalidInterval => "invalid_interval",
            ValidationRule::PastDate => "past_date",
            ValidationRule::RoomUnavailable => "room_unavailable",
            ValidationRule::OutsideOperatingHours => "outside_operating_hours",
            ValidationRule::DurationExceeded => "duration_exceeded",
            ValidationRule::ScheduleConflict => "schedule_conflict",
        }
    }

    /// The draft field the rule is about.
    pub fn field(self) -> &'static str {
        match self {
            ValidationRule::InvalidInterval => "end",
            ValidationRule::PastDate => "date",
            ValidationRule::RoomUnavailable => "room",
            ValidationRule::OutsideOperatingHours
            | ValidationRule::DurationExceeded
            | ValidationRule::ScheduleConflict => "schedule",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: ValidationRule,
    pub message: String,
    /// Set only for `ScheduleConflict`.
    pub conflicting: Option<Conflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub booking_id: Ulid,
    pub slot: TimeSlot,
}

impl ValidationError {
    pub fn new(rule: ValidationRule, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
            conflicting: None,
        }
    }

    pub fn conflict(booking_id: Ulid, slot: TimeSlot) -> Self {
        Self {
            rule: ValidationRule::ScheduleConflict,
            message: format!("room already booked at {slot}"),
            conflicting: Some(Conflict { booking_id, slot }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    Cancel,
    Update,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Confirm => f.write_str("confirm"),
            Transition::Cancel => f.write_str("cancel"),
            Transition::Update => f.write_str("update"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleRule {
    AlreadyConfirmed,
    AlreadyCancelled,
    CancelledImmutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleError {
    pub rule: LifecycleRule,
    pub from: BookingStatus,
    pub attempted: Transition,
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self.rule {
            LifecycleRule::AlreadyConfirmed => "already_confirmed",
            LifecycleRule::AlreadyCancelled => "already_cancelled",
            LifecycleRule::CancelledImmutable => "cancelled_immutable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    NotAuthenticated,
    NotOwner,
    NotAdmin,
}

impl AuthError {
    pub fn code(self) -> &'static str {
        match self {
            AuthError::NotAuthenticated => "not_authenticated",
            AuthError::NotOwner => "not_owner",
            AuthError::NotAdmin => "not_admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room,
    User,
    Booking,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Room => f.write_str("room"),
            Entity::User => f.write_str("user"),
            Entity::Booking => f.write_str("booking"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    Lifecycle(LifecycleError),
    Auth(AuthError),
    NotFound { entity: Entity, id: Ulid },
    Duplicate { field: &'static str, value: String },
    InvalidField { field: &'static str, reason: &'static str },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn not_found(entity: Entity, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// Stable machine-readable code for the rejection.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(e) => e.rule.code(),
            EngineError::Lifecycle(e) => e.code(),
            EngineError::Auth(e) => e.code(),
            EngineError::NotFound { .. } => "not_found",
            EngineError::Duplicate { .. } => "duplicate",
            EngineError::InvalidField { .. } => "invalid_field",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }

    /// Whether the caller did something the rules forbid, as opposed to a server fault.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl From<LifecycleError> for EngineError {
    fn from(e: LifecycleError) -> Self {
        EngineError::Lifecycle(e)
    }
}

impl From<AuthError> for EngineError {
    fn from(e: AuthError) -> Self {
        EngineError::Auth(e)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rule {
            LifecycleRule::AlreadyConfirmed => f.write_str("booking is already confirmed"),
            LifecycleRule::AlreadyCancelled => f.write_str("booking is already cancelled"),
            LifecycleRule::CancelledImmutable => {
                write!(f, "cannot {} a cancelled booking", self.attempted)
            }
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::NotAuthenticated => f.write_str("authentication required"),
            AuthError::NotOwner => f.write_str("only the owner or an admin may do this"),
            AuthError::NotAdmin => f.write_str("admin role required"),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "{e}"),
            EngineError::Lifecycle(e) => write!(f, "{e}"),
            EngineError::Auth(e) => write!(f, "{e}"),
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::Duplicate { field, value } => {
                write!(f, "{field} already in use: {value}")
            }
            EngineError::InvalidField { field, reason } => write!(f, "invalid {field}: {reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for ValidationError {}
impl std::error::Error for LifecycleError {}
impl std::error::Error for AuthError {}
impl std::error::Error for EngineError {}

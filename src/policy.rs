//! Who may do what.
//!
//! Every engine write runs [`authorize`] before any validation or state
//! transition. Operations map onto three policies:
//!
//! - admin-only: the actor must be an admin;
//! - owner-or-admin: the actor owns the resource, or is an admin;
//! - read-only-or-admin: any actor may read, only admins may write.
//!
//! All three require an authenticated actor.

use ulid::Ulid;

use crate::engine::AuthError;
use crate::model::Actor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    AdminOnly,
    OwnerOrAdmin,
    ReadOnlyOrAdmin { write: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateBooking,
    UpdateBooking,
    ConfirmBooking,
    CancelBooking,
    DeleteBooking,
    ReadBookings,
    ReadRooms,
    WriteRoom,
    ReadUser,
    UpdateUser,
    WriteUser,
    ListUsers,
}

impl Operation {
    pub fn policy(self) -> Policy {
        match self {
            Operation::CreateBooking
            | Operation::UpdateBooking
            | Operation::CancelBooking
            | Operation::DeleteBooking
            | Operation::ReadUser
            | Operation::UpdateUser => Policy::OwnerOrAdmin,
            Operation::ConfirmBooking | Operation::WriteUser | Operation::ListUsers => {
                Policy::AdminOnly
            }
            Operation::ReadBookings | Operation::ReadRooms => {
                Policy::ReadOnlyOrAdmin { write: false }
            }
            Operation::WriteRoom => Policy::ReadOnlyOrAdmin { write: true },
        }
    }
}

/// Decide whether `actor` may perform `op` on a resource owned by `owner`.
///
/// Owner-or-admin operations without an owner are admin-only.
pub fn authorize(actor: Option<&Actor>, op: Operation, owner: Option<Ulid>) -> Result<(), AuthError> {
    let actor = actor.ok_or(AuthError::NotAuthenticated)?;
    match op.policy() {
        Policy::AdminOnly | Policy::ReadOnlyOrAdmin { write: true } if !actor.admin => {
            Err(AuthError::NotAdmin)
        }
        Policy::OwnerOrAdmin if !actor.admin && owner != Some(actor.user_id) => {
            Err(AuthError::NotOwner)
        }
        _ => Ok(()),
    }
}

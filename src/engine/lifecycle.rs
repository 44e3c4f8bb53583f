use crate::model::BookingStatus;

use super::error::{LifecycleError, LifecycleRule, Transition};

/// Resolve a status transition.
///
/// `pending → confirmed`, `pending → cancelled`, `confirmed → cancelled`.
/// `cancelled` is terminal. Updates are allowed from any non-cancelled state
/// and keep the status.
pub fn transition(from: BookingStatus, attempted: Transition) -> Result<BookingStatus, LifecycleError> {
    let reject = |rule| LifecycleError { rule, from, attempted };
    match (from, attempted) {
        (BookingStatus::Pending, Transition::Confirm) => Ok(BookingStatus::Confirmed),
        (BookingStatus::Confirmed, Transition::Confirm) => Err(reject(LifecycleRule::AlreadyConfirmed)),
        (BookingStatus::Pending | BookingStatus::Confirmed, Transition::Cancel) => {
            Ok(BookingStatus::Cancelled)
        }
        (BookingStatus::Cancelled, Transition::Cancel) => Err(reject(LifecycleRule::AlreadyCancelled)),
        (BookingStatus::Pending | BookingStatus::Confirmed, Transition::Update) => Ok(from),
        (BookingStatus::Cancelled, Transition::Confirm | Transition::Update) => {
            Err(reject(LifecycleRule::CancelledImmutable))
        }
    }
}

//! Error types for reservation processing.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Points;
use crate::model::{ReservationId, ShowDateId, UserId};
use crate::store::{Retryable, StoreError};

/// Client-facing classification of a failure, for the request layer to map onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Referenced entity is absent or not owned by the caller.
    NotFound,
    /// A state rule was violated (sold out, already cancelled).
    Conflict,
    /// A business gate refused the request (balance, cancellation window).
    PreconditionFailed,
    /// The store failed; surfaces as a server error.
    Internal,
}

/// Top-level error returned by [`Engine::apply`](super::Engine::apply).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("create failed: {0}")]
    Create(#[from] CreateError),

    #[error("cancel failed: {0}")]
    Cancel(#[from] CancelError),

    #[error("list failed: {0}")]
    List(#[from] ListError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Create(e) => e.kind(),
            EngineError::Cancel(e) => e.kind(),
            EngineError::List(e) => e.kind(),
        }
    }
}

/// Error while creating a reservation. Variants are listed in the order they are checked.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("show does not exist (show date {0})")]
    ShowNotFound(ShowDateId),

    #[error("no seats remaining for show date {0}")]
    NoSeatsRemaining(ShowDateId),

    #[error("user does not exist ({0})")]
    UserNotFound(UserId),

    #[error("insufficient balance for user {0}: balance {1}, price {2}")]
    InsufficientBalance(UserId, Points, Points),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CreateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CreateError::ShowNotFound(_) | CreateError::UserNotFound(_) => ErrorKind::NotFound,
            CreateError::NoSeatsRemaining(_) => ErrorKind::Conflict,
            CreateError::InsufficientBalance(..) => ErrorKind::PreconditionFailed,
            CreateError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl Retryable for CreateError {
    fn is_retryable(&self) -> bool {
        matches!(self, CreateError::Store(e) if e.is_retryable())
    }
}

/// Error while cancelling a reservation.
#[derive(Debug, Error)]
pub enum CancelError {
    /// Also returned when the reservation belongs to someone else.
    #[error("no such reservation for this user: reservation {0}, user {1}")]
    ReservationNotFound(ReservationId, UserId),

    #[error("reservation {0} already cancelled")]
    AlreadyCancelled(ReservationId),

    #[error("reservation {0} is completed")]
    Completed(ReservationId),

    #[error("cancellation window has closed for reservation {0}: show starts at {1}")]
    WindowClosed(ReservationId, DateTime<Utc>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CancelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CancelError::ReservationNotFound(..) => ErrorKind::NotFound,
            CancelError::AlreadyCancelled(_) | CancelError::Completed(_) => ErrorKind::Conflict,
            CancelError::WindowClosed(..) => ErrorKind::PreconditionFailed,
            CancelError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl Retryable for CancelError {
    fn is_retryable(&self) -> bool {
        matches!(self, CancelError::Store(e) if e.is_retryable())
    }
}

/// Error while listing a user's reservations.
#[derive(Debug, Error)]
pub enum ListError {
    #[error("no reservations for user {0}")]
    NoReservations(UserId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ListError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ListError::NoReservations(_) => ErrorKind::NotFound,
            ListError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl Retryable for ListError {
    fn is_retryable(&self) -> bool {
        matches!(self, ListError::Store(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(CreateError::ShowNotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(CreateError::NoSeatsRemaining(1).kind(), ErrorKind::Conflict);
        assert_eq!(CreateError::UserNotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(
            CreateError::InsufficientBalance(1, Points::new(50), Points::new(100)).kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            CancelError::ReservationNotFound(1, 2).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(CancelError::AlreadyCancelled(1).kind(), ErrorKind::Conflict);
        assert_eq!(
            CancelError::WindowClosed(1, DateTime::<Utc>::MIN_UTC).kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(ListError::NoReservations(1).kind(), ErrorKind::NotFound);
        assert_eq!(
            EngineError::from(ListError::Store(StoreError::Backend("down".into()))).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn only_store_conflicts_are_retryable() {
        assert!(CreateError::Store(StoreError::Conflict("user 1".into())).is_retryable());
        assert!(!CreateError::Store(StoreError::Backend("down".into())).is_retryable());
        assert!(!CreateError::NoSeatsRemaining(1).is_retryable());
        assert!(CancelError::Store(StoreError::Conflict("user 1".into())).is_retryable());
        assert!(!CancelError::AlreadyCancelled(1).is_retryable());
    }

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            CreateError::NoSeatsRemaining(4).to_string(),
            "no seats remaining for show date 4"
        );
        assert_eq!(
            CreateError::InsufficientBalance(2, Points::new(50), Points::new(100)).to_string(),
            "insufficient balance for user 2: balance 50, price 100"
        );
        assert_eq!(
            EngineError::from(CancelError::AlreadyCancelled(9)).to_string(),
            "cancel failed: reservation 9 already cancelled"
        );
    }
}

//! Transactional access to the inventory, balance and reservation records.
//!
//! The engine never talks to a backend directly: it runs a unit of work
//! through [`transact`], which owns one [`Transaction`] for the whole
//! read-check-write sequence and commits or rolls back as a whole.
//! Backends must provide serializable isolation, reporting a detected
//! interleaving as [`StoreError::Conflict`].

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

use crate::Points;
use crate::model::{
    Reservation, ReservationId, ReservationStatus, ShowDateDetail, ShowDateId, UserBalance, UserId,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent transaction touched the same rows; the unit of work may be retried.
    #[error("serialization conflict on {0}")]
    Conflict(String),

    #[error("backend failure: {0}")]
    Backend(String),

    /// A read or write would break a ledger constraint (capacity, foreign key, sign).
    #[error("constraint violated: {0}")]
    Constraint(String),
}

/// Errors that can tell whether re-running the unit of work may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// How many times a conflicted unit of work is attempted before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// A durable store able to open serializable transactions.
pub trait Store: Send + Sync {
    type Tx: Transaction;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;
}

/// One open transaction over the three ledgers.
///
/// Writes stay private to the transaction until [`commit`](Transaction::commit).
/// Dropping a transaction without committing discards its writes.
pub trait Transaction: Send {
    /// Inventory ledger: a show date joined with its show.
    fn show_date(
        &mut self,
        id: ShowDateId,
    ) -> impl Future<Output = Result<Option<ShowDateDetail>, StoreError>> + Send;

    /// Inventory ledger: overwrite the reserved-seat count of a show date.
    fn set_reserved_count(
        &mut self,
        id: ShowDateId,
        reserved: u32,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Balance ledger: a user's point balance.
    fn user(
        &mut self,
        id: UserId,
    ) -> impl Future<Output = Result<Option<UserBalance>, StoreError>> + Send;

    /// Balance ledger: overwrite a user's point balance.
    fn set_points(
        &mut self,
        id: UserId,
        points: Points,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn reservation(
        &mut self,
        id: ReservationId,
    ) -> impl Future<Output = Result<Option<Reservation>, StoreError>> + Send;

    /// Every reservation of a user, joined with its show date, in no particular order.
    fn reservations_by_user(
        &mut self,
        user: UserId,
    ) -> impl Future<Output = Result<Vec<(Reservation, ShowDateDetail)>, StoreError>> + Send;

    /// Insert a new reservation in `Reserved` status and return it with its id.
    fn insert_reservation(
        &mut self,
        user: UserId,
        show_date: ShowDateId,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Reservation, StoreError>> + Send;

    fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Run `work` as one all-or-nothing unit.
///
/// `work` gets a fresh transaction on every attempt. `Ok` commits, `Err`
/// rolls back. A retryable error (from the work itself or from the commit)
/// re-runs the whole unit until `retry.max_attempts` is reached, so callers
/// only ever observe full success or full failure.
pub async fn transact<S, T, E, F>(store: &S, retry: RetryPolicy, mut work: F) -> Result<T, E>
where
    S: Store,
    T: Send,
    E: From<StoreError> + Retryable + std::fmt::Display + Send,
    F: for<'t> FnMut(&'t mut S::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let mut tx = store.begin().await?;
        let outcome = work(&mut tx).await;
        let result = match outcome {
            Ok(value) => tx.commit().await.map(|()| value).map_err(E::from),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(reason = %rollback, "rollback failed");
                }
                Err(e)
            }
        };

        match result {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                debug!(attempt, reason = %e, "transaction conflicted, retrying");
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(attempts = attempt, reason = %e, "transaction retries exhausted");
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}

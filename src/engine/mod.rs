//! Reservation engine.
//!
//! The engine books and cancels seats of a show date against the user's
//! point balance. Every operation is a single unit of work over the store:
//! preconditions are read and checked inside the same transaction that
//! writes the reservation, the balance and the seat count, so concurrent
//! callers can never double-allocate a seat or overspend a balance.
//! Also supports an async stream of commands.

use futures::FutureExt;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::config::EngineConfig;
use crate::model::{
    Cancellation, Command, ReservationId, ReservationStatus, ReservationView, ShowDateId, UserId,
};
use crate::store::{Store, StoreError, Transaction, transact};

mod clock;
pub use clock::{Clock, FixedClock, SystemClock, cancellation_open};

mod error;
pub use error::{CancelError, CreateError, EngineError, ErrorKind, ListError};

/// Result of a successfully applied [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created(ReservationView),
    Cancelled(Cancellation),
    Listed(Vec<ReservationView>),
}

/// The reservation engine.
///
/// Holds no state of its own besides the store handle, so it can be shared
/// across tasks behind an `Arc`.
pub struct Engine<S, C = SystemClock> {
    store: S,
    clock: C,
    config: EngineConfig,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self::with_clock(store, SystemClock, config)
    }
}

/// Public API
impl<S: Store, C: Clock> Engine<S, C> {
    pub fn with_clock(store: S, clock: C, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the engine with the given command stream
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // a rejected command must not stop the engine, the outcome is logged by `apply`
            let _ = self.apply(command).await;
        }
    }

    /// Apply a single command
    pub async fn apply(&self, command: Command) -> Result<Outcome, EngineError> {
        match command {
            Command::Create { user, show_date } => {
                let result = self.create_reservation(show_date, user).await;
                Self::log_result("create", user, Some(show_date), None, &result);
                Ok(Outcome::Created(result?))
            }
            Command::Cancel { user, reservation } => {
                let result = self.cancel_reservation(reservation, user).await;
                Self::log_result("cancel", user, None, Some(reservation), &result);
                Ok(Outcome::Cancelled(result?))
            }
            Command::List { user } => {
                let result = self.list_reservations(user).await;
                Self::log_result("list", user, None, None, &result);
                Ok(Outcome::Listed(result?))
            }
        }
    }

    /// Book one seat of `show_date` for `user`:
    /// - Ensure the show date exists and has a free seat
    /// - Ensure the user exists and can pay the show's price
    /// - Insert a `Reserved` reservation, debit the price, take the seat
    pub async fn create_reservation(
        &self,
        show_date: ShowDateId,
        user: UserId,
    ) -> Result<ReservationView, CreateError> {
        let now = self.clock.now();

        transact(&self.store, self.config.retry, move |tx: &mut S::Tx| {
            async move {
                let detail = tx
                    .show_date(show_date)
                    .await?
                    .ok_or(CreateError::ShowNotFound(show_date))?;
                let reserved = detail
                    .show_date
                    .reserve_seat()
                    .ok_or(CreateError::NoSeatsRemaining(show_date))?;

                let balance = tx
                    .user(user)
                    .await?
                    .ok_or(CreateError::UserNotFound(user))?;
                let price = detail.show.price;
                let points = balance.points.checked_sub(price).ok_or(
                    CreateError::InsufficientBalance(user, balance.points, price),
                )?;

                let reservation = tx.insert_reservation(user, show_date, now).await?;
                tx.set_points(user, points).await?;
                tx.set_reserved_count(show_date, reserved).await?;

                Ok(ReservationView {
                    reservation,
                    show: detail.summary(),
                })
            }
            .boxed()
        })
        .await
    }

    /// Every reservation of `user`, newest first.
    ///
    /// A user without any reservation gets `ListError::NoReservations` rather
    /// than an empty list.
    pub async fn list_reservations(&self, user: UserId) -> Result<Vec<ReservationView>, ListError> {
        let rows = transact(&self.store, self.config.retry, move |tx: &mut S::Tx| {
            async move { Ok::<_, ListError>(tx.reservations_by_user(user).await?) }.boxed()
        })
        .await?;

        if rows.is_empty() {
            return Err(ListError::NoReservations(user));
        }

        let mut views: Vec<ReservationView> = rows
            .into_iter()
            .map(|(reservation, detail)| ReservationView {
                reservation,
                show: detail.summary(),
            })
            .collect();
        views.sort_by(|a, b| {
            b.reservation
                .created_at
                .cmp(&a.reservation.created_at)
                .then(b.reservation.id.cmp(&a.reservation.id))
        });
        Ok(views)
    }

    /// Cancel reservation `id` on behalf of `user`:
    /// - Ensure the reservation exists and belongs to the user
    /// - Ensure it is still `Reserved`
    /// - Ensure the show is at least the cancellation window away
    /// - Mark it `Cancelled`, refund the show's current price, give the seat back
    pub async fn cancel_reservation(
        &self,
        id: ReservationId,
        user: UserId,
    ) -> Result<Cancellation, CancelError> {
        let now = self.clock.now();
        let window = self.config.cancellation_window;

        transact(&self.store, self.config.retry, move |tx: &mut S::Tx| {
            async move {
                // Someone else's reservation is reported exactly like a missing one
                let reservation = tx
                    .reservation(id)
                    .await?
                    .filter(|r| r.is_owned_by(user))
                    .ok_or(CancelError::ReservationNotFound(id, user))?;

                match reservation.status {
                    ReservationStatus::Reserved => {}
                    ReservationStatus::Cancelled => return Err(CancelError::AlreadyCancelled(id)),
                    ReservationStatus::Completed => return Err(CancelError::Completed(id)),
                }

                let detail = tx.show_date(reservation.show_date).await?.ok_or_else(|| {
                    StoreError::Constraint(format!(
                        "reservation {id} references missing show date {}",
                        reservation.show_date
                    ))
                })?;
                if !cancellation_open(detail.show_date.date, now, window) {
                    return Err(CancelError::WindowClosed(id, detail.show_date.date));
                }

                let balance = tx.user(user).await?.ok_or_else(|| {
                    StoreError::Constraint(format!("user {user} does not exist"))
                })?;
                // The refund follows the show's price as of now, not the price that was paid
                let refund = detail.show.price;
                let points = balance.points.checked_add(refund).ok_or_else(|| {
                    StoreError::Constraint(format!("balance of user {user} would overflow"))
                })?;
                let reserved = detail.show_date.release_seat().ok_or_else(|| {
                    StoreError::Constraint(format!(
                        "show date {} has no reserved seat to release",
                        reservation.show_date
                    ))
                })?;

                tx.set_reservation_status(id, ReservationStatus::Cancelled, now)
                    .await?;
                tx.set_points(user, points).await?;
                tx.set_reserved_count(reservation.show_date, reserved)
                    .await?;

                Ok(Cancellation {
                    reservation: id,
                    refunded: refund,
                })
            }
            .boxed()
        })
        .await
    }
}

/// Private API
impl<S: Store, C: Clock> Engine<S, C> {
    /// Small helper to log `apply` results
    fn log_result<T, E: std::fmt::Display>(
        op: &str,
        user: UserId,
        show_date: Option<ShowDateId>,
        reservation: Option<ReservationId>,
        result: &Result<T, E>,
    ) {
        match result {
            Ok(_) => {
                info!(
                    user = %user,
                    show_date = ?show_date,
                    reservation = ?reservation,
                    "{op} applied"
                );
            }
            Err(e) => {
                info!(
                    user = %user,
                    show_date = ?show_date,
                    reservation = ?reservation,
                    reason = %e,
                    "{op} rejected"
                );
            }
        }
    }
}

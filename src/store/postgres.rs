//! `PostgreSQL` store.
//!
//! Every transaction runs at `SERIALIZABLE`. Postgres aborts one side of any
//! interleaving that could double-book a seat or overspend a balance with
//! SQLSTATE `40001`, which surfaces here as [`StoreError::Conflict`] so that
//! [`transact`](super::transact) can re-run the unit of work.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};

use super::{Store, StoreError, Transaction};
use crate::Points;
use crate::config::PgConfig;
use crate::model::{
    Reservation, ReservationId, ReservationStatus, Show, ShowDate, ShowDateDetail, ShowDateId,
    UserBalance, UserId,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const DETAIL_COLUMNS: &str = "d.id AS show_date_id, d.show_id, d.show_date, d.capacity, d.reserved, \
     s.title, s.category, s.location, s.price";

fn map_err(e: sqlx::Error) -> StoreError {
    if let Some(db) = e.as_database_error() {
        match db.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => return StoreError::Conflict(db.message().to_string()),
            // check_violation, foreign_key_violation
            Some("23514") | Some("23503") => {
                return StoreError::Constraint(db.message().to_string());
            }
            _ => {}
        }
    }
    StoreError::Backend(e.to_string())
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Constraint(format!("{column} out of range: {value}")))
}

fn to_points(value: i64, column: &str) -> Result<Points, StoreError> {
    u64::try_from(value)
        .map(Points::new)
        .map_err(|_| StoreError::Constraint(format!("{column} is negative: {value}")))
}

fn from_points(points: Points) -> Result<i64, StoreError> {
    i64::try_from(points.value())
        .map_err(|_| StoreError::Constraint(format!("{points} points do not fit in BIGINT")))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(map_err)
}

fn detail_from_row(row: &PgRow) -> Result<ShowDateDetail, StoreError> {
    let show_id = to_u32(get(row, "show_id")?, "show_id")?;
    let category: String = get(row, "category")?;
    Ok(ShowDateDetail {
        show: Show {
            id: show_id,
            title: get(row, "title")?,
            category: category
                .parse()
                .map_err(|e| StoreError::Constraint(format!("{e}")))?,
            location: get(row, "location")?,
            price: to_points(get(row, "price")?, "price")?,
        },
        show_date: ShowDate {
            id: to_u32(get(row, "show_date_id")?, "show_date_id")?,
            show_id,
            date: get(row, "show_date")?,
            capacity: to_u32(get(row, "capacity")?, "capacity")?,
            reserved: to_u32(get(row, "reserved")?, "reserved")?,
        },
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, StoreError> {
    let status: String = get(row, "status")?;
    Ok(Reservation {
        id: to_u32(get(row, "reservation_id")?, "reservation_id")?,
        status: status
            .parse()
            .map_err(|e| StoreError::Constraint(format!("{e}")))?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        user: to_u32(get(row, "user_id")?, "user_id")?,
        show_date: to_u32(get(row, "reservation_show_date_id")?, "show_date_id")?,
    })
}

/// Store backed by a `PostgreSQL` connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PgConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(map_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_show(&self, show: &Show) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO shows (id, title, category, location, price)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET title = $2, category = $3, location = $4, price = $5",
        )
        .bind(i64::from(show.id))
        .bind(&show.title)
        .bind(show.category.as_str())
        .bind(&show.location)
        .bind(from_points(show.price)?)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_show_date(&self, show_date: &ShowDate) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO show_dates (id, show_id, show_date, capacity, reserved)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(i64::from(show_date.id))
        .bind(i64::from(show_date.show_id))
        .bind(show_date.date)
        .bind(i64::from(show_date.capacity))
        .bind(i64::from(show_date.reserved))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn insert_user(&self, user: &UserBalance) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id, points) VALUES ($1, $2)")
            .bind(i64::from(user.user))
            .bind(from_points(user.points)?)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        Ok(PgTx { tx })
    }
}

/// Serializable transaction over a [`PgStore`].
pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

/// Private API
impl PgTx {
    async fn expect_one_row(
        &mut self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        what: String,
    ) -> Result<(), StoreError> {
        let result = query.execute(&mut *self.tx).await.map_err(map_err)?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Constraint(format!("{what} does not exist")));
        }
        Ok(())
    }
}

impl Transaction for PgTx {
    async fn show_date(&mut self, id: ShowDateId) -> Result<Option<ShowDateDetail>, StoreError> {
        let sql = format!(
            "SELECT {DETAIL_COLUMNS}
             FROM show_dates d JOIN shows s ON s.id = d.show_id
             WHERE d.id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(i64::from(id))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)?;
        row.as_ref().map(detail_from_row).transpose()
    }

    async fn set_reserved_count(&mut self, id: ShowDateId, reserved: u32) -> Result<(), StoreError> {
        let query = sqlx::query("UPDATE show_dates SET reserved = $2 WHERE id = $1")
            .bind(i64::from(id))
            .bind(i64::from(reserved));
        self.expect_one_row(query, format!("show date {id}")).await
    }

    async fn user(&mut self, id: UserId) -> Result<Option<UserBalance>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT points FROM users WHERE id = $1")
            .bind(i64::from(id))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)?;
        row.map(|(points,)| Ok(UserBalance::new(id, to_points(points, "points")?)))
            .transpose()
    }

    async fn set_points(&mut self, id: UserId, points: Points) -> Result<(), StoreError> {
        let query = sqlx::query("UPDATE users SET points = $2 WHERE id = $1")
            .bind(i64::from(id))
            .bind(from_points(points)?);
        self.expect_one_row(query, format!("user {id}")).await
    }

    async fn reservation(&mut self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        let row = sqlx::query(
            "SELECT id AS reservation_id, status, created_at, updated_at, user_id,
                    show_date_id AS reservation_show_date_id
             FROM reservations WHERE id = $1",
        )
        .bind(i64::from(id))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn reservations_by_user(
        &mut self,
        user: UserId,
    ) -> Result<Vec<(Reservation, ShowDateDetail)>, StoreError> {
        let sql = format!(
            "SELECT r.id AS reservation_id, r.status, r.created_at, r.updated_at, r.user_id,
                    r.show_date_id AS reservation_show_date_id, {DETAIL_COLUMNS}
             FROM reservations r
             JOIN show_dates d ON d.id = r.show_date_id
             JOIN shows s ON s.id = d.show_id
             WHERE r.user_id = $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(user))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_err)?;
        rows.iter()
            .map(|row| Ok((reservation_from_row(row)?, detail_from_row(row)?)))
            .collect()
    }

    async fn insert_reservation(
        &mut self,
        user: UserId,
        show_date: ShowDateId,
        at: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO reservations (status, created_at, updated_at, user_id, show_date_id)
             VALUES ($1, $2, $2, $3, $4)
             RETURNING id",
        )
        .bind(ReservationStatus::Reserved.as_str())
        .bind(at)
        .bind(i64::from(user))
        .bind(i64::from(show_date))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;

        Ok(Reservation {
            id: to_u32(id, "reservation id")?,
            status: ReservationStatus::Reserved,
            created_at: at,
            updated_at: at,
            user,
            show_date,
        })
    }

    async fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = sqlx::query("UPDATE reservations SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(i64::from(id))
            .bind(status.as_str())
            .bind(at);
        self.expect_one_row(query, format!("reservation {id}")).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_err)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_enforces_ledger_invariants() {
        assert!(SCHEMA.contains("reserved <= capacity"));
        assert!(SCHEMA.contains("CHECK (points >= 0)"));
    }

    #[test]
    fn conversions_reject_out_of_range_values() {
        assert!(matches!(to_u32(-1, "id"), Err(StoreError::Constraint(_))));
        assert_eq!(to_u32(7, "id").unwrap(), 7);
        assert!(matches!(to_points(-5, "points"), Err(StoreError::Constraint(_))));
        assert!(matches!(
            from_points(Points::new(u64::MAX)),
            Err(StoreError::Constraint(_))
        ));
    }

    #[test]
    fn non_database_errors_are_backend_failures() {
        assert!(matches!(map_err(sqlx::Error::RowNotFound), StoreError::Backend(_)));
    }
}

//! In-process store with optimistic, snapshot-validated transactions.
//!
//! Every commit takes the next value of a store-wide sequence and stamps the
//! rows it writes with it. A transaction records the sequence at `begin` as
//! its snapshot: reading a row stamped after the snapshot fails with
//! [`StoreError::Conflict`], and so does committing when any row read has
//! been stamped since. Every decision a transaction makes, rejections
//! included, is therefore taken on one consistent state. The latch is only
//! held for single reads and for the validate-and-apply step, never across a
//! whole unit of work.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Store, StoreError, Transaction};
use crate::Points;
use crate::model::{
    Reservation, ReservationId, ReservationStatus, Show, ShowDate, ShowDateDetail, ShowDateId,
    ShowId, UserBalance, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Show(ShowId),
    ShowDate(ShowDateId),
    User(UserId),
    Reservation(ReservationId),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Show(id) => write!(f, "show {id}"),
            RowKey::ShowDate(id) => write!(f, "show date {id}"),
            RowKey::User(id) => write!(f, "user {id}"),
            RowKey::Reservation(id) => write!(f, "reservation {id}"),
        }
    }
}

#[derive(Debug)]
struct Versioned<T> {
    /// Sequence number of the commit that last wrote the row
    committed_at: u64,
    row: T,
}

impl<T> Versioned<T> {
    fn new(row: T, seq: u64) -> Self {
        Self {
            committed_at: seq,
            row,
        }
    }

    fn replace(&mut self, row: T, seq: u64) {
        self.committed_at = seq;
        self.row = row;
    }
}

#[derive(Debug, Default)]
struct Tables {
    shows: HashMap<ShowId, Versioned<Show>>,
    show_dates: HashMap<ShowDateId, Versioned<ShowDate>>,
    users: HashMap<UserId, Versioned<UserBalance>>,
    reservations: HashMap<ReservationId, Versioned<Reservation>>,
    last_reservation_id: ReservationId,
    commit_seq: u64,
}

impl Tables {
    /// Commit that last wrote a row; absent rows report 0.
    fn committed_at(&self, key: RowKey) -> u64 {
        match key {
            RowKey::Show(id) => self.shows.get(&id).map_or(0, |v| v.committed_at),
            RowKey::ShowDate(id) => self.show_dates.get(&id).map_or(0, |v| v.committed_at),
            RowKey::User(id) => self.users.get(&id).map_or(0, |v| v.committed_at),
            RowKey::Reservation(id) => self.reservations.get(&id).map_or(0, |v| v.committed_at),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.commit_seq += 1;
        self.commit_seq
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory store. Cloning is cheap and every clone sees the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

/// Catalog and user seeding, plus committed-state snapshots.
///
/// These stand in for the collaborators that own shows and users; the engine
/// itself only goes through [`Transaction`].
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_show(&self, show: Show) {
        let mut tables = lock(&self.tables);
        let seq = tables.next_seq();
        tables.shows.insert(show.id, Versioned::new(show, seq));
    }

    /// Add a show date. Fails if its show is unknown or it is already over capacity.
    pub fn insert_show_date(&self, show_date: ShowDate) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        if !tables.shows.contains_key(&show_date.show_id) {
            return Err(StoreError::Constraint(format!(
                "show date {} references missing show {}",
                show_date.id, show_date.show_id
            )));
        }
        if show_date.reserved > show_date.capacity {
            return Err(StoreError::Constraint(format!(
                "show date {} has {} reserved seats for a capacity of {}",
                show_date.id, show_date.reserved, show_date.capacity
            )));
        }
        let seq = tables.next_seq();
        tables
            .show_dates
            .insert(show_date.id, Versioned::new(show_date, seq));
        Ok(())
    }

    pub fn insert_user(&self, user: UserBalance) {
        let mut tables = lock(&self.tables);
        let seq = tables.next_seq();
        tables.users.insert(user.user, Versioned::new(user, seq));
    }

    /// Change a show's price, as the catalog owner would. Returns `false` for an unknown show.
    pub fn update_show_price(&self, id: ShowId, price: Points) -> bool {
        let mut tables = lock(&self.tables);
        if !tables.shows.contains_key(&id) {
            return false;
        }
        let seq = tables.next_seq();
        if let Some(entry) = tables.shows.get_mut(&id) {
            let show = Show {
                price,
                ..entry.row.clone()
            };
            entry.replace(show, seq);
        }
        true
    }

    pub fn show_date(&self, id: ShowDateId) -> Option<ShowDate> {
        lock(&self.tables)
            .show_dates
            .get(&id)
            .map(|v| v.row.clone())
    }

    pub fn user(&self, id: UserId) -> Option<UserBalance> {
        lock(&self.tables).users.get(&id).map(|v| v.row)
    }

    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        lock(&self.tables)
            .reservations
            .get(&id)
            .map(|v| v.row.clone())
    }

    /// All users, ordered by id.
    pub fn users(&self) -> Vec<UserBalance> {
        let mut users: Vec<_> = lock(&self.tables).users.values().map(|v| v.row).collect();
        users.sort_by_key(|u| u.user);
        users
    }

    /// All reservations, ordered by id.
    pub fn reservations(&self) -> Vec<Reservation> {
        let mut reservations: Vec<_> = lock(&self.tables)
            .reservations
            .values()
            .map(|v| v.row.clone())
            .collect();
        reservations.sort_by_key(|r| r.id);
        reservations
    }
}

impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let snapshot = lock(&self.tables).commit_seq;
        Ok(MemoryTx {
            tables: Arc::clone(&self.tables),
            snapshot,
            reads: HashSet::new(),
            show_dates: HashMap::new(),
            users: HashMap::new(),
            reservations: HashMap::new(),
        })
    }
}

/// Transaction over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTx {
    tables: Arc<Mutex<Tables>>,
    /// Last commit visible to this transaction
    snapshot: u64,
    /// Every row touched
    reads: HashSet<RowKey>,
    /// Buffered writes, visible to this transaction only
    show_dates: HashMap<ShowDateId, ShowDate>,
    users: HashMap<UserId, UserBalance>,
    reservations: HashMap<ReservationId, Reservation>,
}

/// Private API
impl MemoryTx {
    /// Record `key` in the read set. Fails once the row has moved past the snapshot.
    fn observe(&mut self, tables: &Tables, key: RowKey) -> Result<(), StoreError> {
        self.reads.insert(key);
        if tables.committed_at(key) > self.snapshot {
            return Err(StoreError::Conflict(key.to_string()));
        }
        Ok(())
    }

    fn read_show_date(
        &mut self,
        tables: &Tables,
        id: ShowDateId,
    ) -> Result<Option<ShowDate>, StoreError> {
        self.observe(tables, RowKey::ShowDate(id))?;
        Ok(self
            .show_dates
            .get(&id)
            .cloned()
            .or_else(|| tables.show_dates.get(&id).map(|v| v.row.clone())))
    }

    fn read_detail(
        &mut self,
        tables: &Tables,
        id: ShowDateId,
    ) -> Result<Option<ShowDateDetail>, StoreError> {
        let Some(show_date) = self.read_show_date(tables, id)? else {
            return Ok(None);
        };
        self.observe(tables, RowKey::Show(show_date.show_id))?;
        let show = tables
            .shows
            .get(&show_date.show_id)
            .map(|v| v.row.clone())
            .ok_or_else(|| {
                StoreError::Constraint(format!(
                    "show date {id} references missing show {}",
                    show_date.show_id
                ))
            })?;
        Ok(Some(ShowDateDetail { show, show_date }))
    }

    fn read_user(&mut self, tables: &Tables, id: UserId) -> Result<Option<UserBalance>, StoreError> {
        self.observe(tables, RowKey::User(id))?;
        Ok(self
            .users
            .get(&id)
            .copied()
            .or_else(|| tables.users.get(&id).map(|v| v.row)))
    }

    fn read_reservation(
        &mut self,
        tables: &Tables,
        id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        self.observe(tables, RowKey::Reservation(id))?;
        Ok(self
            .reservations
            .get(&id)
            .cloned()
            .or_else(|| tables.reservations.get(&id).map(|v| v.row.clone())))
    }
}

impl Transaction for MemoryTx {
    async fn show_date(&mut self, id: ShowDateId) -> Result<Option<ShowDateDetail>, StoreError> {
        let shared = Arc::clone(&self.tables);
        let tables = lock(&shared);
        self.read_detail(&tables, id)
    }

    async fn set_reserved_count(&mut self, id: ShowDateId, reserved: u32) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.tables);
        let tables = lock(&shared);
        let current = self
            .read_show_date(&tables, id)?
            .ok_or_else(|| StoreError::Constraint(format!("show date {id} does not exist")))?;
        if reserved > current.capacity {
            return Err(StoreError::Constraint(format!(
                "show date {id} cannot hold {reserved} reservations with capacity {}",
                current.capacity
            )));
        }
        self.show_dates.insert(
            id,
            ShowDate {
                reserved,
                ..current
            },
        );
        Ok(())
    }

    async fn user(&mut self, id: UserId) -> Result<Option<UserBalance>, StoreError> {
        let shared = Arc::clone(&self.tables);
        let tables = lock(&shared);
        self.read_user(&tables, id)
    }

    async fn set_points(&mut self, id: UserId, points: Points) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.tables);
        let tables = lock(&shared);
        if self.read_user(&tables, id)?.is_none() {
            return Err(StoreError::Constraint(format!("user {id} does not exist")));
        }
        self.users.insert(id, UserBalance::new(id, points));
        Ok(())
    }

    async fn reservation(&mut self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        let shared = Arc::clone(&self.tables);
        let tables = lock(&shared);
        self.read_reservation(&tables, id)
    }

    async fn reservations_by_user(
        &mut self,
        user: UserId,
    ) -> Result<Vec<(Reservation, ShowDateDetail)>, StoreError> {
        let shared = Arc::clone(&self.tables);
        let tables = lock(&shared);

        let mut ids: Vec<ReservationId> = tables
            .reservations
            .values()
            .filter(|v| v.row.user == user)
            .map(|v| v.row.id)
            .collect();
        ids.extend(
            self.reservations
                .values()
                .filter(|r| r.user == user && !tables.reservations.contains_key(&r.id))
                .map(|r| r.id),
        );

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(reservation) = self.read_reservation(&tables, id)? else {
                continue;
            };
            let detail = self.read_detail(&tables, reservation.show_date)?.ok_or_else(|| {
                StoreError::Constraint(format!(
                    "reservation {id} references missing show date {}",
                    reservation.show_date
                ))
            })?;
            rows.push((reservation, detail));
        }
        Ok(rows)
    }

    async fn insert_reservation(
        &mut self,
        user: UserId,
        show_date: ShowDateId,
        at: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let shared = Arc::clone(&self.tables);
        let mut tables = lock(&shared);
        if !tables.users.contains_key(&user) {
            return Err(StoreError::Constraint(format!("user {user} does not exist")));
        }
        if !tables.show_dates.contains_key(&show_date) {
            return Err(StoreError::Constraint(format!(
                "show date {show_date} does not exist"
            )));
        }

        // Sequence values are never handed out twice, even if this transaction rolls back
        tables.last_reservation_id += 1;
        let id = tables.last_reservation_id;
        self.observe(&tables, RowKey::Reservation(id))?;

        let reservation = Reservation {
            id,
            status: ReservationStatus::Reserved,
            created_at: at,
            updated_at: at,
            user,
            show_date,
        };
        self.reservations.insert(id, reservation.clone());
        Ok(reservation)
    }

    async fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.tables);
        let tables = lock(&shared);
        let current = self
            .read_reservation(&tables, id)?
            .ok_or_else(|| StoreError::Constraint(format!("reservation {id} does not exist")))?;
        self.reservations.insert(
            id,
            Reservation {
                status,
                updated_at: at,
                ..current
            },
        );
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);

        if let Some(key) = self
            .reads
            .iter()
            .find(|key| tables.committed_at(**key) > self.snapshot)
        {
            return Err(StoreError::Conflict(key.to_string()));
        }

        let seq = tables.next_seq();
        for (id, show_date) in self.show_dates {
            match tables.show_dates.get_mut(&id) {
                Some(entry) => entry.replace(show_date, seq),
                None => {
                    tables.show_dates.insert(id, Versioned::new(show_date, seq));
                }
            }
        }
        for (id, user) in self.users {
            match tables.users.get_mut(&id) {
                Some(entry) => entry.replace(user, seq),
                None => {
                    tables.users.insert(id, Versioned::new(user, seq));
                }
            }
        }
        for (id, reservation) in self.reservations {
            match tables.reservations.get_mut(&id) {
                Some(entry) => entry.replace(reservation, seq),
                None => {
                    tables.reservations.insert(id, Versioned::new(reservation, seq));
                }
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShowCategory;
    use crate::store::{RetryPolicy, transact};
    use futures::FutureExt;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_show(Show {
            id: 1,
            title: "Cats".to_string(),
            category: ShowCategory::Musical,
            location: "Seoul".to_string(),
            price: Points::new(100),
        });
        store
            .insert_show_date(ShowDate {
                id: 10,
                show_id: 1,
                date: at(),
                capacity: 2,
                reserved: 0,
            })
            .unwrap();
        store.insert_user(UserBalance::new(1, Points::new(500)));
        store
    }

    #[test]
    fn insert_show_date_rejects_missing_show() {
        let store = MemoryStore::new();
        let result = store.insert_show_date(ShowDate {
            id: 10,
            show_id: 99,
            date: at(),
            capacity: 1,
            reserved: 0,
        });
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }

    #[test]
    fn insert_show_date_rejects_overbooked_seed() {
        let store = seeded();
        let result = store.insert_show_date(ShowDate {
            id: 11,
            show_id: 1,
            date: at(),
            capacity: 1,
            reserved: 2,
        });
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }

    #[tokio::test]
    async fn writes_are_private_until_commit() {
        let store = seeded();
        let mut tx = store.begin().await.unwrap();
        tx.set_points(1, Points::new(400)).await.unwrap();

        // visible to the writer
        let user = tx.user(1).await.unwrap().unwrap();
        assert_eq!(user.points, Points::new(400));
        // invisible to everyone else
        assert_eq!(store.user(1).unwrap().points, Points::new(500));

        tx.commit().await.unwrap();
        assert_eq!(store.user(1).unwrap().points, Points::new(400));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = seeded();
        let mut tx = store.begin().await.unwrap();
        tx.set_reserved_count(10, 1).await.unwrap();
        tx.insert_reservation(1, 10, at()).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.show_date(10).unwrap().reserved, 0);
        assert!(store.reservations().is_empty());
    }

    #[tokio::test]
    async fn stale_read_conflicts_on_commit() {
        let store = seeded();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let seen_by_first = first.show_date(10).await.unwrap().unwrap();
        let seen_by_second = second.show_date(10).await.unwrap().unwrap();
        assert_eq!(seen_by_first.show_date.reserved, 0);
        assert_eq!(seen_by_second.show_date.reserved, 0);

        first.set_reserved_count(10, 1).await.unwrap();
        second.set_reserved_count(10, 1).await.unwrap();

        first.commit().await.unwrap();
        let result = second.commit().await;
        assert!(matches!(result, Err(StoreError::Conflict(ref key)) if key == "show date 10"));
        assert_eq!(store.show_date(10).unwrap().reserved, 1);
    }

    #[tokio::test]
    async fn reads_never_mix_states_from_before_and_after_a_commit() {
        let store = seeded();

        let mut tx = store.begin().await.unwrap();
        let before = tx.show_date(10).await.unwrap().unwrap();
        assert_eq!(before.show_date.reserved, 0);

        // Someone books the seat and pays for it after our first read
        let mut other = store.begin().await.unwrap();
        other.set_reserved_count(10, 1).await.unwrap();
        other.set_points(1, Points::new(400)).await.unwrap();
        other.commit().await.unwrap();

        // Seeing the debited balance next to the free seat would be read skew
        let result = tx.user(1).await;
        assert!(matches!(result, Err(StoreError::Conflict(ref key)) if key == "user 1"));
        assert!(matches!(tx.commit().await, Err(StoreError::Conflict(_))));

        // A transaction started afterwards sees both writes
        let mut fresh = store.begin().await.unwrap();
        assert_eq!(fresh.show_date(10).await.unwrap().unwrap().show_date.reserved, 1);
        assert_eq!(fresh.user(1).await.unwrap().unwrap().points, Points::new(400));
    }

    #[tokio::test]
    async fn rows_added_after_begin_conflict_instead_of_appearing() {
        let store = seeded();
        let mut tx = store.begin().await.unwrap();

        store.insert_user(UserBalance::new(2, Points::new(10)));

        assert!(matches!(tx.user(2).await, Err(StoreError::Conflict(_))));
        // Untouched rows stay readable
        assert!(tx.show_date(10).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conflicting_commit_applies_nothing() {
        let store = seeded();

        let mut loser = store.begin().await.unwrap();
        loser.user(1).await.unwrap();
        loser.set_reserved_count(10, 2).await.unwrap();
        loser.set_points(1, Points::new(0)).await.unwrap();

        let mut winner = store.begin().await.unwrap();
        winner.set_points(1, Points::new(450)).await.unwrap();
        winner.commit().await.unwrap();

        assert!(matches!(loser.commit().await, Err(StoreError::Conflict(_))));
        assert_eq!(store.show_date(10).unwrap().reserved, 0);
        assert_eq!(store.user(1).unwrap().points, Points::new(450));
    }

    #[tokio::test]
    async fn price_change_invalidates_readers_of_the_show() {
        let store = seeded();
        let mut tx = store.begin().await.unwrap();
        tx.show_date(10).await.unwrap();
        store.update_show_price(1, Points::new(150));
        assert!(matches!(tx.commit().await, Err(StoreError::Conflict(ref key)) if key == "show 1"));
    }

    #[tokio::test]
    async fn set_reserved_count_enforces_capacity() {
        let store = seeded();
        let mut tx = store.begin().await.unwrap();
        let result = tx.set_reserved_count(10, 3).await;
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }

    #[tokio::test]
    async fn reservation_ids_are_never_reused() {
        let store = seeded();

        let mut rolled_back = store.begin().await.unwrap();
        let burned = rolled_back.insert_reservation(1, 10, at()).await.unwrap();
        rolled_back.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let kept = tx.insert_reservation(1, 10, at()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(burned.id, 1);
        assert_eq!(kept.id, 2);
        assert_eq!(store.reservation(2).unwrap().status, ReservationStatus::Reserved);
    }

    #[tokio::test]
    async fn reservations_by_user_sees_own_inserts() {
        let store = seeded();
        store.insert_user(UserBalance::new(2, Points::new(500)));

        let mut tx = store.begin().await.unwrap();
        tx.insert_reservation(1, 10, at()).await.unwrap();
        tx.insert_reservation(2, 10, at()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_reservation(1, 10, at()).await.unwrap();
        let rows = tx.reservations_by_user(1).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|(r, d)| r.user == 1 && d.show.id == 1));
    }

    #[tokio::test]
    async fn transact_retries_conflicted_work() {
        let store = seeded();
        let mut attempts = 0;

        let points = transact(&store, RetryPolicy::default(), |tx: &mut MemoryTx| {
            attempts += 1;
            let interfere = attempts == 1;
            let store = store.clone();
            async move {
                let user = tx.user(1).await?.unwrap();
                if interfere {
                    // a concurrent writer commits between our read and our commit
                    let mut other = store.begin().await?;
                    other.set_points(1, Points::new(1)).await?;
                    other.commit().await?;
                }
                let points = Points::new(user.points.value() - 1);
                tx.set_points(1, points).await?;
                Ok::<_, StoreError>(points)
            }
            .boxed()
        })
        .await
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(points, Points::new(0));
        assert_eq!(store.user(1).unwrap().points, Points::new(0));
    }

    #[tokio::test]
    async fn transact_gives_up_after_max_attempts() {
        let store = seeded();
        let mut attempts = 0;

        let result = transact(&store, RetryPolicy { max_attempts: 3 }, |tx: &mut MemoryTx| {
            attempts += 1;
            let store = store.clone();
            async move {
                tx.user(1).await?;
                let mut other = store.begin().await?;
                other.set_points(1, Points::new(7)).await?;
                other.commit().await?;
                tx.set_points(1, Points::new(3)).await?;
                Ok::<_, StoreError>(())
            }
            .boxed()
        })
        .await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(attempts, 3);
        assert_eq!(store.user(1).unwrap().points, Points::new(7));
    }
}

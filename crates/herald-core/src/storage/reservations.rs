//! Repository for credit reservations, settlements and balances.
//!
//! A reservation moves credits from available into `reserved` on the owner's
//! balance row. Each settlement slice is recorded in `credit_settlements`
//! keyed by `(reservation_id, slice_key)`, so committing or releasing the same
//! message twice is a no-op. The balance row is locked first in every
//! mutating transaction, which serializes reservations per owner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{
        CreditBalance, CreditReservation, OwnerId, ReservationId, ReservationStatus,
        ReserveOutcome, SettleOutcome, SettlementKind,
    },
};

/// Repository for the credit ledger.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Holds `amount` credits under `key`.
    ///
    /// An active reservation with the same key is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn reserve(
        &self,
        owner_id: OwnerId,
        key: &str,
        amount: i64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        let balance = lock_balance(&mut tx, owner_id).await?;

        let existing = sqlx::query_as::<_, CreditReservation>(
            r#"
            SELECT id, owner_id, reservation_key, amount, committed, released, status,
                   created_at, expires_at
            FROM credit_reservations
            WHERE reservation_key = $1 AND status = 'active'
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = existing {
            tx.rollback().await?;
            return Ok(ReserveOutcome::Existing(existing));
        }

        let available = balance.map_or(0, |b| b.available());
        if available < amount {
            tx.rollback().await?;
            return Ok(ReserveOutcome::Insufficient { required: amount, available });
        }

        sqlx::query("UPDATE credit_balances SET reserved = reserved + $2 WHERE owner_id = $1")
            .bind(owner_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        let reservation = sqlx::query_as::<_, CreditReservation>(
            r#"
            INSERT INTO credit_reservations (
                id, owner_id, reservation_key, amount, committed, released, status,
                created_at, expires_at
            ) VALUES ($1, $2, $3, $4, 0, 0, 'active', $5, $6)
            RETURNING id, owner_id, reservation_key, amount, committed, released, status,
                      created_at, expires_at
            "#,
        )
        .bind(ReservationId::new())
        .bind(owner_id)
        .bind(key)
        .bind(amount)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ReserveOutcome::Reserved(reservation))
    }

    /// Commits or releases one slice of a reservation.
    ///
    /// `slice_key` identifies the slice (the recipient message id), making
    /// the call idempotent per slice.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn settle(
        &self,
        reservation_id: ReservationId,
        slice_key: &str,
        kind: SettlementKind,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(reservation) = lock_reservation(&mut tx, reservation_id).await? else {
            tx.rollback().await?;
            return Ok(SettleOutcome::Inactive);
        };
        lock_balance(&mut tx, reservation.owner_id).await?;

        let already: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM credit_settlements
            WHERE reservation_id = $1 AND slice_key = $2
            "#,
        )
        .bind(reservation_id)
        .bind(slice_key)
        .fetch_optional(&mut *tx)
        .await?;

        if already.is_some() {
            tx.rollback().await?;
            return Ok(SettleOutcome::AlreadySettled);
        }
        if reservation.status != ReservationStatus::Active {
            tx.rollback().await?;
            return Ok(SettleOutcome::Inactive);
        }
        if amount > reservation.unsettled() {
            tx.rollback().await?;
            return Ok(SettleOutcome::Exceeded);
        }

        sqlx::query(
            r#"
            INSERT INTO credit_settlements (reservation_id, slice_key, kind, amount, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(reservation_id)
        .bind(slice_key)
        .bind(kind.as_str())
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (committed, released) = match kind {
            SettlementKind::Commit => (amount, 0),
            SettlementKind::Release => (0, amount),
        };
        apply_settlement(&mut tx, &reservation, committed, released, None).await?;

        tx.commit().await?;

        Ok(SettleOutcome::Applied)
    }

    /// Releases whatever is still unsettled and closes the reservation.
    ///
    /// Returns the number of credits released.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn release_remaining(&self, reservation_id: ReservationId) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let Some(reservation) = lock_reservation(&mut tx, reservation_id).await? else {
            tx.rollback().await?;
            return Ok(0);
        };
        if reservation.status != ReservationStatus::Active {
            tx.rollback().await?;
            return Ok(0);
        }
        lock_balance(&mut tx, reservation.owner_id).await?;

        let remaining = reservation.unsettled();
        apply_settlement(&mut tx, &reservation, 0, remaining, None).await?;

        tx.commit().await?;

        Ok(remaining)
    }

    /// Expires active reservations past their deadline.
    ///
    /// Returns the ids of the reservations that were expired.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ReservationId>> {
        let mut tx = self.pool.begin().await?;

        let due = sqlx::query_as::<_, CreditReservation>(
            r#"
            SELECT id, owner_id, reservation_key, amount, committed, released, status,
                   created_at, expires_at
            FROM credit_reservations
            WHERE status = 'active' AND expires_at < $1
            ORDER BY expires_at ASC
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut expired = Vec::with_capacity(due.len());
        for reservation in due {
            lock_balance(&mut tx, reservation.owner_id).await?;
            apply_settlement(
                &mut tx,
                &reservation,
                0,
                reservation.unsettled(),
                Some(ReservationStatus::Expired),
            )
            .await?;
            expired.push(reservation.id);
        }

        tx.commit().await?;

        Ok(expired)
    }

    /// Finds a reservation by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: ReservationId) -> Result<Option<CreditReservation>> {
        let reservation = sqlx::query_as::<_, CreditReservation>(
            r#"
            SELECT id, owner_id, reservation_key, amount, committed, released, status,
                   created_at, expires_at
            FROM credit_reservations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(reservation)
    }

    /// Returns the owner's balance, or zero if the owner never bought
    /// credits.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn balance(&self, owner_id: OwnerId) -> Result<CreditBalance> {
        let balance = sqlx::query_as::<_, CreditBalance>(
            "SELECT owner_id, balance, reserved FROM credit_balances WHERE owner_id = $1",
        )
        .bind(owner_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(balance.unwrap_or(CreditBalance { owner_id, balance: 0, reserved: 0 }))
    }

    /// Adds purchased credits to the owner's balance.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn credit(&self, owner_id: OwnerId, amount: i64) -> Result<CreditBalance> {
        let balance = sqlx::query_as::<_, CreditBalance>(
            r#"
            INSERT INTO credit_balances (owner_id, balance, reserved)
            VALUES ($1, $2, 0)
            ON CONFLICT (owner_id) DO UPDATE
            SET balance = credit_balances.balance + EXCLUDED.balance
            RETURNING owner_id, balance, reserved
            "#,
        )
        .bind(owner_id)
        .bind(amount)
        .fetch_one(&*self.pool)
        .await?;

        Ok(balance)
    }
}

async fn lock_balance(
    tx: &mut Transaction<'_, Postgres>,
    owner_id: OwnerId,
) -> Result<Option<CreditBalance>> {
    let balance = sqlx::query_as::<_, CreditBalance>(
        r#"
        SELECT owner_id, balance, reserved
        FROM credit_balances
        WHERE owner_id = $1
        FOR UPDATE
        "#,
    )
    .bind(owner_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(balance)
}

async fn lock_reservation(
    tx: &mut Transaction<'_, Postgres>,
    id: ReservationId,
) -> Result<Option<CreditReservation>> {
    let reservation = sqlx::query_as::<_, CreditReservation>(
        r#"
        SELECT id, owner_id, reservation_key, amount, committed, released, status,
               created_at, expires_at
        FROM credit_reservations
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(reservation)
}

/// Adds to `committed`/`released`, moves the balance, and closes the
/// reservation once nothing is left unsettled.
async fn apply_settlement(
    tx: &mut Transaction<'_, Postgres>,
    reservation: &CreditReservation,
    committed: i64,
    released: i64,
    closing_status: Option<ReservationStatus>,
) -> Result<()> {
    let mut next = reservation.clone();
    next.committed += committed;
    next.released += released;
    let status = match closing_status {
        Some(status) => status,
        None if next.unsettled() == 0 => next.settled_status(),
        None => ReservationStatus::Active,
    };

    sqlx::query(
        r#"
        UPDATE credit_reservations
        SET committed = $2, released = $3, status = $4
        WHERE id = $1
        "#,
    )
    .bind(reservation.id)
    .bind(next.committed)
    .bind(next.released)
    .bind(status.as_str())
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE credit_balances
        SET balance = balance - $2, reserved = reserved - $3
        WHERE owner_id = $1
        "#,
    )
    .bind(reservation.owner_id)
    .bind(committed)
    .bind(committed + released)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

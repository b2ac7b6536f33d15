//! Lease rows backing the distributed worker lock.
//!
//! A lease is taken when the key is absent or its `expires_at` has passed.
//! Refresh and release only succeed for the token that holds the lease.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{error::Result, models::LeaseInfo};

/// Repository for worker lease rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Takes the lease if it is free or expired.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO worker_locks (key, token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE worker_locks.expires_at <= $4
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    /// Extends the lease if `token` still holds it.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn refresh(&self, key: &str, token: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE worker_locks SET expires_at = $3 WHERE key = $1 AND token = $2",
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes the lease if `token` still holds it.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM worker_locks WHERE key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Reads the current lease, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn inspect(&self, key: &str) -> Result<Option<LeaseInfo>> {
        let lease = sqlx::query_as::<_, LeaseInfo>(
            "SELECT key, token, expires_at FROM worker_locks WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(lease)
    }
}

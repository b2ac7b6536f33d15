//! Repository for the PostgreSQL-backed job queue.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED` so many workers can poll
//! the same queue without blocking each other. A claimed job carries a
//! visibility deadline; if the worker dies the job becomes claimable again
//! once `locked_until` passes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{JobId, JobRecord},
};

/// Repository for job queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Publishes a job.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobId> {
        self.enqueue_impl(&*self.pool, queue, payload, run_at, now).await
    }

    /// Publishes a job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        payload: &serde_json::Value,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobId> {
        self.enqueue_impl(&mut **tx, queue, payload, run_at, now).await
    }

    async fn enqueue_impl<'e, E>(
        &self,
        executor: E,
        queue: &str,
        payload: &serde_json::Value,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, status, attempts, run_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $5)
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(payload)
        .bind(run_at)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(id)
    }

    /// Claims up to `batch_size` due jobs from `queue`.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim(
        &self,
        queue: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
    ) -> Result<Vec<JobRecord>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE queue = $1
              AND ((status = 'pending' AND run_at <= $2)
                   OR (status = 'running' AND locked_until <= $2))
            ORDER BY run_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET status = 'running',
                attempts = attempts + 1,
                locked_until = $2,
                updated_at = $3
            WHERE id = ANY($1)
            RETURNING id, queue, payload, status, attempts, run_at, locked_until,
                      last_error, created_at, updated_at
            "#,
        )
        .bind(&ids)
        .bind(now + visibility_timeout)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(jobs)
    }

    /// Marks a job completed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', locked_until = NULL, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns a job to `pending` to run again at `run_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reschedule(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', run_at = $2, locked_until = NULL,
                last_error = COALESCE($3, last_error), updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(reason)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a job permanently failed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn fail(&self, id: JobId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', locked_until = NULL, last_error = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Replaces a running job's payload, e.g. to persist a fan-out cursor.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn checkpoint_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET payload = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(payload)
            .bind(now)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Finds a job by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, queue, payload, status, attempts, run_at, locked_until,
                   last_error, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }
}

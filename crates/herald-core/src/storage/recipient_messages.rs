//! Repository for per-recipient message rows.
//!
//! Send transitions only apply to `queued` rows and reconciliation only
//! applies to `accepted` rows, so re-running a job never regresses a row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{CampaignId, RecipientCounts, RecipientMessage, RecipientMessageId, RecipientStatus},
};

/// Repository for recipient message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts rows, skipping contacts that already have a row for the
    /// campaign. Returns only the rows that were actually inserted.
    ///
    /// # Errors
    ///
    /// Returns error if an insert fails for a reason other than the
    /// `(campaign_id, contact_id)` conflict.
    pub async fn insert_batch_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rows: &[RecipientMessage],
    ) -> Result<Vec<RecipientMessage>> {
        let mut inserted = Vec::with_capacity(rows.len());

        for row in rows {
            let created = sqlx::query_as::<_, RecipientMessage>(
                r#"
                INSERT INTO recipient_messages (
                    id, campaign_id, contact_id, phone, status, provider_message_id,
                    credits_charged, send_attempts, last_error, created_at, updated_at,
                    accepted_at
                ) VALUES ($1, $2, $3, $4, $5, NULL, 0, 0, NULL, $6, $6, NULL)
                ON CONFLICT (campaign_id, contact_id) DO NOTHING
                RETURNING id, campaign_id, contact_id, phone, status, provider_message_id,
                          credits_charged, send_attempts, last_error, created_at, updated_at,
                          accepted_at
                "#,
            )
            .bind(row.id)
            .bind(row.campaign_id)
            .bind(row.contact_id)
            .bind(&row.phone)
            .bind(RecipientStatus::Queued.as_str())
            .bind(row.created_at)
            .fetch_optional(&mut **tx)
            .await?;

            if let Some(created) = created {
                inserted.push(created);
            }
        }

        Ok(inserted)
    }

    /// Finds a row by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: RecipientMessageId) -> Result<Option<RecipientMessage>> {
        let row = sqlx::query_as::<_, RecipientMessage>(
            r#"
            SELECT id, campaign_id, contact_id, phone, status, provider_message_id,
                   credits_charged, send_attempts, last_error, created_at, updated_at,
                   accepted_at
            FROM recipient_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Lists every row of a campaign.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<RecipientMessage>> {
        let rows = sqlx::query_as::<_, RecipientMessage>(
            r#"
            SELECT id, campaign_id, contact_id, phone, status, provider_message_id,
                   credits_charged, send_attempts, last_error, created_at, updated_at,
                   accepted_at
            FROM recipient_messages
            WHERE campaign_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Marks a queued row accepted by the provider.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_accepted(
        &self,
        id: RecipientMessageId,
        provider_message_id: &str,
        credits_charged: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recipient_messages
            SET status = 'accepted',
                provider_message_id = $2,
                credits_charged = $3,
                accepted_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .bind(credits_charged)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a queued row as failed to send.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed_send(
        &self,
        id: RecipientMessageId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recipient_messages
            SET status = 'failed_send', last_error = $2, updated_at = $3
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Counts a retryable send failure on a queued row.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_send_error(
        &self,
        id: RecipientMessageId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE recipient_messages
            SET send_attempts = send_attempts + 1, last_error = $2, updated_at = $3
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Applies a delivery receipt to an accepted row.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn apply_delivery_status(
        &self,
        id: RecipientMessageId,
        status: RecipientStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recipient_messages
            SET status = $2, updated_at = $3
            WHERE id = $1 AND status = 'accepted'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Pages accepted rows carrying a provider id, ordered by id.
    ///
    /// `campaign_id = None` pages across every campaign.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn accepted_page(
        &self,
        campaign_id: Option<CampaignId>,
        after: Option<RecipientMessageId>,
        limit: usize,
    ) -> Result<Vec<RecipientMessage>> {
        let rows = sqlx::query_as::<_, RecipientMessage>(
            r#"
            SELECT id, campaign_id, contact_id, phone, status, provider_message_id,
                   credits_charged, send_attempts, last_error, created_at, updated_at,
                   accepted_at
            FROM recipient_messages
            WHERE status = 'accepted'
              AND provider_message_id IS NOT NULL
              AND ($1::uuid IS NULL OR campaign_id = $1)
              AND ($2::uuid IS NULL OR id > $2)
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Tallies rows per status for one campaign.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn counts(&self, campaign_id: CampaignId) -> Result<RecipientCounts> {
        self.counts_impl(&*self.pool, campaign_id).await
    }

    async fn counts_impl<'e, E>(&self, executor: E, campaign_id: CampaignId) -> Result<RecipientCounts>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let rows: Vec<(RecipientStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM recipient_messages
            WHERE campaign_id = $1
            GROUP BY status
            "#,
        )
        .bind(campaign_id)
        .fetch_all(executor)
        .await?;

        let mut counts = RecipientCounts::default();
        for (status, count) in rows {
            match status {
                RecipientStatus::Queued => counts.queued = count,
                RecipientStatus::Accepted => counts.accepted = count,
                RecipientStatus::Delivered => counts.delivered = count,
                RecipientStatus::FailedDelivery => counts.failed_delivery = count,
                RecipientStatus::FailedSend => counts.failed_send = count,
            }
        }

        Ok(counts)
    }

    /// Most recent change to any row of the campaign.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn last_activity(&self, campaign_id: CampaignId) -> Result<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(updated_at) FROM recipient_messages WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(last)
    }
}

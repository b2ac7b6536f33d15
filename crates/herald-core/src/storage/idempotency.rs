//! Repository for enqueue idempotency records.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{CampaignId, IdempotencyRecord},
};

/// Repository for idempotency records.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Looks up the record for `(campaign_id, key)`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, campaign_id: CampaignId, key: &str) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT campaign_id, idempotency_key, queued, reservation_id, created_at
            FROM campaign_idempotency
            WHERE campaign_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(campaign_id)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Stores a record, returning the one already stored if another request
    /// won the race.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(&self, record: &IdempotencyRecord) -> Result<IdempotencyRecord> {
        let inserted = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            INSERT INTO campaign_idempotency (
                campaign_id, idempotency_key, queued, reservation_id, created_at
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (campaign_id, idempotency_key) DO NOTHING
            RETURNING campaign_id, idempotency_key, queued, reservation_id, created_at
            "#,
        )
        .bind(record.campaign_id)
        .bind(&record.idempotency_key)
        .bind(record.queued)
        .bind(record.reservation_id)
        .bind(record.created_at)
        .fetch_optional(&*self.pool)
        .await?;

        match inserted {
            Some(record) => Ok(record),
            None => self.find(record.campaign_id, &record.idempotency_key).await?.ok_or_else(|| {
                CoreError::NotFound(format!(
                    "idempotency record for campaign {} vanished after conflict",
                    record.campaign_id
                ))
            }),
        }
    }
}

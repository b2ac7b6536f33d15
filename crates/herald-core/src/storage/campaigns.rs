//! Repository for campaign lifecycle operations.
//!
//! All status changes are compare-and-swap updates. A `false` return means
//! another actor moved the campaign first and the caller must re-read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Campaign, CampaignId, CampaignStatus, ReservationId},
};

/// Repository for campaign database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a campaign by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            SELECT id, owner_id, name, status, audience, body, scheduled_at,
                   total_recipients, reservation_id, fanout_completed_at,
                   last_reconcile_requested_at, started_at, finished_at,
                   created_at, updated_at
            FROM campaigns
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(campaign)
    }

    /// Inserts a campaign.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, campaign: &Campaign) -> Result<CampaignId> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, owner_id, name, status, audience, body, scheduled_at,
                total_recipients, reservation_id, fanout_completed_at,
                last_reconcile_requested_at, started_at, finished_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(campaign.id)
        .bind(campaign.owner_id)
        .bind(&campaign.name)
        .bind(campaign.status.as_str())
        .bind(&campaign.audience)
        .bind(&campaign.body)
        .bind(campaign.scheduled_at)
        .bind(campaign.total_recipients)
        .bind(campaign.reservation_id)
        .bind(campaign.fanout_completed_at)
        .bind(campaign.last_reconcile_requested_at)
        .bind(campaign.started_at)
        .bind(campaign.finished_at)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(campaign.id)
    }

    /// Flips an enqueueable campaign to `sending`.
    ///
    /// Clears any previous fan-out completion so a resumed or re-enqueued
    /// campaign walks its audience again.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn begin_sending(
        &self,
        id: CampaignId,
        reservation_id: ReservationId,
        estimated_recipients: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'sending',
                reservation_id = $2,
                total_recipients = $3,
                started_at = COALESCE(started_at, $4),
                fanout_completed_at = NULL,
                finished_at = NULL,
                updated_at = $4
            WHERE id = $1
              AND status IN ('draft', 'scheduled', 'paused')
            "#,
        )
        .bind(id)
        .bind(reservation_id)
        .bind(estimated_recipients)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a campaign from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn transition(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records that fan-out walked the whole audience.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete_fanout(
        &self,
        id: CampaignId,
        total_recipients: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET fanout_completed_at = $3, total_recipients = $2, updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(total_recipients)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a sending campaign to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn finalize(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2, finished_at = $3, updated_at = $3
            WHERE id = $1
              AND status = 'sending'
              AND fanout_completed_at IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Lists every campaign currently sending.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_sending(&self) -> Result<Vec<Campaign>> {
        let campaigns = sqlx::query_as::<_, Campaign>(
            r#"
            SELECT id, owner_id, name, status, audience, body, scheduled_at,
                   total_recipients, reservation_id, fanout_completed_at,
                   last_reconcile_requested_at, started_at, finished_at,
                   created_at, updated_at
            FROM campaigns
            WHERE status = 'sending'
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(campaigns)
    }

    /// Stamps a manual reconcile request unless one happened within
    /// `cooldown`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim_reconcile_slot(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET last_reconcile_requested_at = $2
            WHERE id = $1
              AND (last_reconcile_requested_at IS NULL
                   OR last_reconcile_requested_at <= $3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now - cooldown)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

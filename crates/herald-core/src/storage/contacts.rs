//! Audience resolution over the contacts table.
//!
//! An audience is every non-opted-out contact of the owner whose tags overlap
//! the campaign's tags, or all of the owner's contacts when the campaign has
//! no tags. Pages are ordered by contact id so a cursor can resume fan-out.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Contact, ContactId, OwnerId},
};

/// Repository for contact lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a contact.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, contact: &Contact) -> Result<ContactId> {
        sqlx::query(
            r#"
            INSERT INTO contacts (id, owner_id, phone, tags, opted_out, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(contact.id)
        .bind(contact.owner_id)
        .bind(&contact.phone)
        .bind(&contact.tags)
        .bind(contact.opted_out)
        .bind(contact.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(contact.id)
    }

    /// Counts the audience selected by `tags`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_audience(&self, owner_id: OwnerId, tags: &[String]) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM contacts
            WHERE owner_id = $1
              AND NOT opted_out
              AND (cardinality($2::text[]) = 0 OR tags && $2::text[])
            "#,
        )
        .bind(owner_id)
        .bind(tags)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Returns the next page of the audience after `after`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn page_audience(
        &self,
        owner_id: OwnerId,
        tags: &[String],
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<Contact>> {
        let contacts = sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, owner_id, phone, tags, opted_out, created_at
            FROM contacts
            WHERE owner_id = $1
              AND NOT opted_out
              AND (cardinality($2::text[]) = 0 OR tags && $2::text[])
              AND ($3::uuid IS NULL OR id > $3)
            ORDER BY id ASC
            LIMIT $4
            "#,
        )
        .bind(owner_id)
        .bind(tags)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(contacts)
    }
}

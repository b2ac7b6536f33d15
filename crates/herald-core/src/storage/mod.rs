//! PostgreSQL repositories for campaign pipeline state.
//!
//! Every state transition is a guarded `UPDATE ... WHERE status = ...` so that
//! concurrent workers and duplicate job deliveries cannot move a row twice.
//! Repositories take the current time as an argument; callers pass their
//! `Clock` so persisted timestamps agree with virtual time in tests.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

pub mod campaigns;
pub mod contacts;
pub mod idempotency;
pub mod jobs;
pub mod recipient_messages;
pub mod reservations;
pub mod worker_locks;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Campaign lifecycle.
    pub campaigns: Arc<campaigns::Repository>,

    /// Per-recipient message rows.
    pub recipient_messages: Arc<recipient_messages::Repository>,

    /// Credit reservations, settlements and balances.
    pub reservations: Arc<reservations::Repository>,

    /// Enqueue idempotency records.
    pub idempotency: Arc<idempotency::Repository>,

    /// Job queue rows.
    pub jobs: Arc<jobs::Repository>,

    /// Audience resolution over contacts.
    pub contacts: Arc<contacts::Repository>,

    /// Worker leader leases.
    pub worker_locks: Arc<worker_locks::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            campaigns: Arc::new(campaigns::Repository::new(pool.clone())),
            recipient_messages: Arc::new(recipient_messages::Repository::new(pool.clone())),
            reservations: Arc::new(reservations::Repository::new(pool.clone())),
            idempotency: Arc::new(idempotency::Repository::new(pool.clone())),
            jobs: Arc::new(jobs::Repository::new(pool.clone())),
            contacts: Arc::new(contacts::Repository::new(pool.clone())),
            worker_locks: Arc::new(worker_locks::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Starts a transaction spanning several repositories.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a connection cannot be obtained.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}

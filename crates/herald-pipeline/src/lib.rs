//! Campaign send pipeline.
//!
//! This crate turns an enqueued campaign into provider sends and tracks them
//! through delivery. All state lives in PostgreSQL; every step is a job on a
//! durable queue, so any worker may crash at any point and the next claim
//! resumes the work.
//!
//! # Flow
//!
//! 1. **Enqueue** - validate the campaign, reserve credits for the whole
//!    audience, flip it to `sending` and publish `campaign-send`.
//! 2. **Fan-out** - page the audience, insert one recipient row per contact
//!    and publish one `sms-send` job per new row, checkpointing the cursor.
//! 3. **Send** - rate limit, call the provider, commit one slice of the
//!    reservation on acceptance or release it on permanent failure.
//! 4. **Reconcile** - poll the provider for delivery receipts and move
//!    accepted rows to `delivered` or `failed_delivery`.
//! 5. **Finalize** - once nothing is queued, mark the campaign terminal and
//!    release whatever the reservation has left.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{storage::Storage, Clock, RealClock};
//! use herald_pipeline::{
//!     HttpSmsProvider, PipelineBackends, PipelineConfig, PipelineEngine, ProviderConfig,
//! };
//!
//! # async fn example(storage: Arc<Storage>) -> herald_pipeline::Result<()> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let provider = Arc::new(HttpSmsProvider::new(ProviderConfig::default())?);
//! let mut engine = PipelineEngine::new(
//!     PipelineBackends::postgres(storage, clock.clone()),
//!     provider,
//!     clock,
//!     PipelineConfig::default(),
//! );
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod campaigns;
pub mod engine;
pub mod enqueue;
pub mod error;
pub mod fanout;
pub mod finalize;
pub mod ledger;
pub mod lock;
pub mod maintenance;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod send;
pub mod status;
pub mod storage;
mod worker;
mod worker_pool;

pub use campaigns::{CampaignService, ReconcileRequest};
pub use engine::{EngineStats, PipelineBackends, PipelineConfig, PipelineEngine};
pub use enqueue::{EnqueueOutcome, EnqueueService, EnqueueSettings};
pub use error::{PipelineError, Result};
pub use ledger::{CreditLedger, PostgresCreditLedger};
pub use lock::{LeaseGuard, LeaseStore, LockConfig, LockStatus, PostgresLeaseStore, WorkerLock};
pub use provider::{HttpSmsProvider, ProviderConfig, SmsProvider};
pub use queue::{Job, JobQueue, QueueName};
pub use reconcile::{classify_provider_code, ReconcileReport};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use status::CampaignStatusDocument;
pub use storage::{mock::MemoryBackend, PipelineStorage, PostgresPipelineStorage};
pub use worker::WorkerSettings;

/// Default number of jobs claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default number of `sms-send` workers.
pub const DEFAULT_SMS_WORKERS: usize = 8;

/// Default provider send rate across all send workers.
pub const DEFAULT_SMS_RATE_PER_SECOND: u32 = 20;

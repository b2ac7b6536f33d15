//! Pipeline engine.
//!
//! Wires the storage, queue, ledger and provider into the queue handlers and
//! owns the worker pool that runs them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ PipelineEngine │──▶│ Worker Pool  │──▶│ HandlerTable  │
//! └────────────────┘   └──────────────┘   └───────────────┘
//!        │                   │                    │
//!        ▼                   ▼                    ▼
//! ┌───────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Scheduler     │   │ Job queue    │   │ SMS provider  │
//! └───────────────┘   └──────────────┘   └───────────────┘
//! ```
//!
//! Handlers are registered explicitly: `campaign-send`, `sms-send`,
//! `delivery-status-update` and `reconciliation`. `automation-trigger` has
//! no consumer here, so its jobs fail with `NO_HANDLER`.

use std::{sync::Arc, time::Duration};

use herald_core::{storage::Storage, Clock};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    campaigns::CampaignService,
    enqueue::{EnqueueService, EnqueueSettings},
    error::Result,
    fanout::{FanoutHandler, FanoutSettings},
    finalize::CampaignFinalizer,
    ledger::{CreditLedger, PostgresCreditLedger},
    maintenance::{MaintenanceHandler, ReservationSweeper, StuckCampaignDetector},
    provider::SmsProvider,
    queue::{HandlerTable, JobQueue, QueueName},
    rate_limit::RateLimiter,
    reconcile::{DeliveryReconciler, DeliveryStatusHandler, ReconcileSettings},
    retry::RetryPolicy,
    scheduler::{Scheduler, SchedulerSettings},
    send::{SendHandler, SendSettings},
    storage::{mock::MemoryBackend, PipelineStorage, PostgresPipelineStorage},
    worker::{QueueWorker, WorkerSettings},
    worker_pool::WorkerPool,
};

/// Configuration for the pipeline engine.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Workers consuming `campaign-send`.
    pub fanout_workers: usize,
    /// Workers consuming `sms-send`.
    pub sms_workers: usize,
    /// Workers consuming `delivery-status-update`.
    pub reconcile_workers: usize,
    /// Provider sends per second across all send workers.
    pub sms_rate_per_second: u32,
    /// Claim batch and poll settings for every worker.
    pub worker: WorkerSettings,
    /// Fan-out tuning.
    pub fanout: FanoutSettings,
    /// Send tuning.
    pub send: SendSettings,
    /// Reconciliation tuning.
    pub reconcile: ReconcileSettings,
    /// Enqueue pricing and reservation TTL.
    pub enqueue: EnqueueSettings,
    /// Scheduler intervals.
    pub scheduler: SchedulerSettings,
    /// Idle time after which a sending campaign is reported stuck.
    pub stuck_campaign_after: chrono::Duration,
    /// Minimum gap between manual reconcile requests for one campaign.
    pub reconcile_cooldown: chrono::Duration,
    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fanout_workers: 1,
            sms_workers: crate::DEFAULT_SMS_WORKERS,
            reconcile_workers: 1,
            sms_rate_per_second: crate::DEFAULT_SMS_RATE_PER_SECOND,
            worker: WorkerSettings::default(),
            fanout: FanoutSettings::default(),
            send: SendSettings::default(),
            reconcile: ReconcileSettings::default(),
            enqueue: EnqueueSettings::default(),
            scheduler: SchedulerSettings::default(),
            stuck_campaign_after: chrono::Duration::minutes(15),
            reconcile_cooldown: chrono::Duration::seconds(180),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Send retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.send.retry_policy
    }
}

/// Statistics for engine monitoring.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Running queue workers.
    pub active_workers: usize,
    /// Jobs handled since startup.
    pub jobs_processed: u64,
    /// Jobs completed.
    pub jobs_completed: u64,
    /// Jobs rescheduled.
    pub jobs_retried: u64,
    /// Jobs failed permanently.
    pub jobs_failed: u64,
    /// Jobs currently being handled.
    pub in_flight_jobs: u64,
}

/// Storage, queue and ledger the engine runs against.
#[derive(Clone)]
pub struct PipelineBackends {
    /// Campaign, recipient and idempotency storage.
    pub storage: Arc<dyn PipelineStorage>,
    /// Durable job queue.
    pub queue: Arc<dyn JobQueue>,
    /// Credit ledger.
    pub ledger: Arc<dyn CreditLedger>,
}

impl PipelineBackends {
    /// PostgreSQL-backed storage, queue and ledger.
    pub fn postgres(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        let adapter = Arc::new(PostgresPipelineStorage::new(storage.clone(), clock.clone()));
        Self {
            storage: adapter.clone(),
            queue: adapter,
            ledger: Arc::new(PostgresCreditLedger::new(storage, clock)),
        }
    }

    /// One in-memory backend serving all three roles.
    pub fn memory(backend: Arc<MemoryBackend>) -> Self {
        Self { storage: backend.clone(), queue: backend.clone(), ledger: backend }
    }
}

/// Pipeline engine coordinating queue workers and the scheduler.
pub struct PipelineEngine {
    backends: PipelineBackends,
    config: PipelineConfig,
    handlers: Arc<HandlerTable>,
    enqueue: Arc<EnqueueService>,
    campaigns: Arc<CampaignService>,
    reconciler: Arc<DeliveryReconciler>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl PipelineEngine {
    /// Builds the services and the handler table. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        backends: PipelineBackends,
        provider: Arc<dyn SmsProvider>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        let PipelineBackends { storage, queue, ledger } = backends.clone();

        let finalizer = Arc::new(CampaignFinalizer::new(storage.clone(), ledger.clone()));
        let limiter = Arc::new(RateLimiter::new(config.sms_rate_per_second, clock.clone()));
        let reconciler = Arc::new(DeliveryReconciler::new(
            storage.clone(),
            queue.clone(),
            provider.clone(),
            clock.clone(),
            config.reconcile.clone(),
        ));

        let mut handlers = HandlerTable::new();
        handlers
            .register(
                QueueName::CampaignSend,
                Arc::new(FanoutHandler::new(
                    storage.clone(),
                    queue.clone(),
                    finalizer.clone(),
                    clock.clone(),
                    config.fanout.clone(),
                )),
            )
            .register(
                QueueName::SmsSend,
                Arc::new(SendHandler::new(
                    storage.clone(),
                    ledger.clone(),
                    provider,
                    finalizer.clone(),
                    limiter,
                    clock.clone(),
                    config.send.clone(),
                )),
            )
            .register(
                QueueName::DeliveryStatusUpdate,
                Arc::new(DeliveryStatusHandler::new(reconciler.clone())),
            )
            .register(
                QueueName::Reconciliation,
                Arc::new(MaintenanceHandler::new(
                    Arc::new(StuckCampaignDetector::new(
                        storage.clone(),
                        finalizer,
                        clock.clone(),
                        config.stuck_campaign_after,
                    )),
                    Arc::new(ReservationSweeper::new(ledger.clone())),
                )),
            );

        let enqueue = Arc::new(EnqueueService::new(
            storage.clone(),
            ledger.clone(),
            queue.clone(),
            clock.clone(),
            config.enqueue.clone(),
        ));
        let campaigns = Arc::new(CampaignService::new(
            storage,
            ledger,
            queue,
            clock.clone(),
            config.enqueue.clone(),
            config.reconcile_cooldown,
        ));

        Self {
            backends,
            config,
            handlers: Arc::new(handlers),
            enqueue,
            campaigns,
            reconciler,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        }
    }

    /// Enqueue gateway.
    pub fn enqueue_service(&self) -> Arc<EnqueueService> {
        self.enqueue.clone()
    }

    /// Pause, resume, reconcile and status.
    pub fn campaign_service(&self) -> Arc<CampaignService> {
        self.campaigns.clone()
    }

    /// Delivery reconciler, for direct polls.
    pub fn reconciler(&self) -> Arc<DeliveryReconciler> {
        self.reconciler.clone()
    }

    /// Backends the engine runs against.
    pub fn backends(&self) -> &PipelineBackends {
        &self.backends
    }

    /// Queues with a registered handler.
    pub fn handled_queues(&self) -> Vec<QueueName> {
        self.handlers.queues()
    }

    /// Spawns the queue workers and the scheduler.
    ///
    /// Returns immediately. Use [`shutdown`](Self::shutdown) to stop.
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature leaves room for startup checks.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            fanout_workers = self.config.fanout_workers,
            sms_workers = self.config.sms_workers,
            reconcile_workers = self.config.reconcile_workers,
            sms_rate_per_second = self.config.sms_rate_per_second,
            "starting pipeline engine"
        );

        let mut pool = WorkerPool::new(
            self.backends.queue.clone(),
            self.handlers.clone(),
            self.config.worker.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        pool.spawn_workers(&[
            (QueueName::CampaignSend, self.config.fanout_workers),
            (QueueName::SmsSend, self.config.sms_workers),
            (QueueName::DeliveryStatusUpdate, self.config.reconcile_workers),
            (QueueName::Reconciliation, 1),
            (QueueName::AutomationTrigger, 1),
        ])
        .await;

        let scheduler = Scheduler::new(
            self.backends.queue.clone(),
            self.clock.clone(),
            self.config.scheduler.clone(),
            self.cancellation_token.clone(),
        );
        pool.spawn_task("scheduler", async move { scheduler.run().await });

        self.worker_pool = Some(pool);
        info!("pipeline engine started");
        Ok(())
    }

    /// Cancels workers and waits for in-flight jobs to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers outlive the shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down pipeline engine");
        match self.worker_pool.take() {
            Some(pool) => pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => {
                info!("pipeline engine was not started");
                Ok(())
            },
        }
    }

    /// Token that stops the workers when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Current statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Shared statistics, readable after the engine has been moved into a
    /// shutdown task.
    pub fn stats_handle(&self) -> Arc<RwLock<EngineStats>> {
        self.stats.clone()
    }

    /// Claims and processes one batch from `queue` on the calling task.
    ///
    /// Runs a temporary worker without starting the pool, so tests can
    /// step the pipeline deterministically. Returns the number of jobs
    /// claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn run_queue_once(&self, queue: QueueName) -> Result<usize> {
        let worker = QueueWorker::new(
            0,
            queue,
            self.backends.queue.clone(),
            self.handlers.clone(),
            self.config.worker.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        worker.process_batch().await
    }
}

//! Queue worker.
//!
//! A worker claims batches from one queue, decodes each payload and hands it
//! to the queue's registered handler. Handler outcomes are applied to the
//! job row; handler errors are logged and the job is rescheduled with
//! backoff so a worker never dies on a bad job.

use std::{sync::Arc, time::Duration};

use herald_core::{Clock, JobRecord};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::EngineStats,
    error::{PipelineError, Result},
    queue::{ClaimedJob, HandlerTable, JobOutcome, JobQueue, QueueName},
    retry::{RetryContext, RetryPolicy},
};

/// Settings shared by every queue worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Jobs claimed per batch.
    pub batch_size: usize,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// How long a claimed job stays hidden from other workers.
    pub visibility_timeout: Duration,
    /// Backoff for jobs whose handler returned an error.
    pub handler_retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(300),
            handler_retry: RetryPolicy { max_attempts: 10, ..RetryPolicy::default() },
        }
    }
}

/// Worker bound to one queue.
pub struct QueueWorker {
    id: usize,
    queue: QueueName,
    jobs: Arc<dyn JobQueue>,
    handlers: Arc<HandlerTable>,
    settings: WorkerSettings,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl QueueWorker {
    /// Creates a new queue worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queue: QueueName,
        jobs: Arc<dyn JobQueue>,
        handlers: Arc<HandlerTable>,
        settings: WorkerSettings,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, queue, jobs, handlers, settings, stats, cancellation_token, clock }
    }

    /// Claims and processes batches until cancelled.
    ///
    /// # Errors
    ///
    /// Never fails today; batch errors are logged and retried after a pause.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, queue = %self.queue, "queue worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.settings.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(err) => {
                    error!(
                        worker_id = self.id,
                        queue = %self.queue,
                        error = %err,
                        "queue batch failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, queue = %self.queue, "queue worker stopped");
        Ok(())
    }

    /// Claims one batch and processes it. Returns the number of jobs claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let visibility = chrono::Duration::from_std(self.settings.visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let records = self
            .jobs
            .claim(self.queue, self.settings.batch_size, visibility)
            .await
            .map_err(|e| PipelineError::database(format!("failed to claim {} jobs: {e}", self.queue)))?;
        let claimed = records.len();

        if claimed > 0 {
            debug!(worker_id = self.id, queue = %self.queue, claimed, "claimed job batch");
        }

        let mut records = records.into_iter();
        while let Some(record) = records.next() {
            if self.cancellation_token.is_cancelled() {
                self.return_unprocessed(std::iter::once(record).chain(records.by_ref())).await;
                break;
            }
            let job_id = record.id;
            if let Err(err) = self.process_job(record).await {
                error!(
                    worker_id = self.id,
                    queue = %self.queue,
                    job_id = %job_id,
                    error = %err,
                    "failed to record job outcome"
                );
            }
        }

        Ok(claimed)
    }

    /// Hands claimed jobs back to the queue so another worker can take them
    /// now instead of after the visibility timeout.
    async fn return_unprocessed(&self, records: impl Iterator<Item = JobRecord>) {
        let now = self.clock.now_utc();
        let mut returned = 0;
        for record in records {
            match self.jobs.retry(record.id, now, None).await {
                Ok(()) => returned += 1,
                Err(err) => warn!(
                    worker_id = self.id,
                    queue = %self.queue,
                    job_id = %record.id,
                    error = %err,
                    "failed to return unprocessed job"
                ),
            }
        }
        if returned > 0 {
            info!(worker_id = self.id, queue = %self.queue, returned, "returned unprocessed jobs on shutdown");
        }
    }

    async fn process_job(&self, record: JobRecord) -> Result<()> {
        {
            let mut stats = self.stats.write().await;
            stats.in_flight_jobs += 1;
        }

        let result = self.dispatch(record).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight_jobs -= 1;
            stats.jobs_processed += 1;
            match &result {
                Ok(JobOutcome::Completed) => stats.jobs_completed += 1,
                Ok(JobOutcome::Retry { .. }) => stats.jobs_retried += 1,
                Ok(JobOutcome::Failed { .. }) | Err(_) => stats.jobs_failed += 1,
            }
        }

        result.map(|_| ())
    }

    async fn dispatch(&self, record: JobRecord) -> Result<JobOutcome> {
        let id = record.id;
        let claimed = match ClaimedJob::try_from(record) {
            Ok(claimed) => claimed,
            Err(err) => return self.apply(id, JobOutcome::Failed { reason: err.to_string() }).await,
        };

        let job = match claimed.decode() {
            Ok(job) => job,
            Err(err) => {
                warn!(job_id = %id, queue = %self.queue, error = %err, "undecodable job payload");
                let reason = format!("INVALID_PAYLOAD: {err}");
                return self.apply(id, JobOutcome::Failed { reason }).await;
            },
        };

        let Some(handler) = self.handlers.get(self.queue) else {
            let err = PipelineError::NoHandler { queue: self.queue.to_string() };
            warn!(job_id = %id, queue = %self.queue, "no handler registered");
            return self.apply(id, JobOutcome::Failed { reason: err.code() }).await;
        };

        let outcome = match handler.handle(&claimed, job).await {
            Ok(outcome) => outcome,
            Err(err) => self.handler_error_outcome(&claimed, err),
        };

        self.apply(id, outcome).await
    }

    fn handler_error_outcome(&self, claimed: &ClaimedJob, err: PipelineError) -> JobOutcome {
        error!(
            worker_id = self.id,
            queue = %self.queue,
            job_id = %claimed.id,
            attempt = claimed.attempts,
            error = %err,
            "job handler failed"
        );

        let policy = &self.settings.handler_retry;
        if claimed.attempts >= policy.max_attempts {
            return JobOutcome::Failed {
                reason: format!("{}: handler failed {} times: {err}", err.code(), claimed.attempts),
            };
        }

        // Every handler error counts as transient here, whatever its kind.
        let now = self.clock.now_utc();
        let reason = err.to_string();
        let delay = RetryContext::new(claimed.attempts, err, now, policy.clone()).calculate_delay();
        let run_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        JobOutcome::Retry { run_at, reason }
    }

    async fn apply(&self, id: herald_core::JobId, outcome: JobOutcome) -> Result<JobOutcome> {
        match &outcome {
            JobOutcome::Completed => self.jobs.complete(id).await?,
            JobOutcome::Retry { run_at, reason } => {
                self.jobs.retry(id, *run_at, Some(reason.clone())).await?;
            },
            JobOutcome::Failed { reason } => {
                warn!(job_id = %id, queue = %self.queue, reason = %reason, "job failed");
                self.jobs.fail(id, reason.clone()).await?;
            },
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use herald_core::{ContactId, JobStatus, TestClock};
    use uuid::Uuid;

    use super::*;
    use crate::{
        queue::{AutomationTriggerJob, BoxFuture, Job, JobHandler},
        storage::mock::MemoryBackend,
    };

    /// Completes its job and cancels the worker on the first call.
    struct CancelAfterFirst(CancellationToken);

    impl JobHandler for CancelAfterFirst {
        fn handle<'a>(&'a self, _claimed: &'a ClaimedJob, _job: Job) -> BoxFuture<'a, Result<JobOutcome>> {
            Box::pin(async move {
                self.0.cancel();
                Ok(JobOutcome::Completed)
            })
        }
    }

    fn trigger() -> Job {
        Job::AutomationTrigger(AutomationTriggerJob {
            automation_id: Uuid::new_v4(),
            contact_id: ContactId::new(),
            event: "signed_up".to_string(),
        })
    }

    #[tokio::test]
    async fn cancellation_returns_the_rest_of_the_batch() {
        let clock = Arc::new(TestClock::new());
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        for _ in 0..3 {
            backend.publish(trigger(), clock.now_utc()).await.unwrap();
        }

        let token = CancellationToken::new();
        let mut handlers = HandlerTable::new();
        handlers.register(QueueName::AutomationTrigger, Arc::new(CancelAfterFirst(token.clone())));
        let worker = QueueWorker::new(
            0,
            QueueName::AutomationTrigger,
            backend.clone(),
            Arc::new(handlers),
            WorkerSettings { batch_size: 3, ..WorkerSettings::default() },
            Arc::new(RwLock::new(EngineStats::default())),
            token,
            clock.clone(),
        );

        assert_eq!(worker.process_batch().await.unwrap(), 3);

        let jobs = backend.jobs(QueueName::AutomationTrigger).await;
        let completed = jobs.iter().filter(|job| job.status == JobStatus::Completed).count();
        let returned: Vec<_> = jobs.iter().filter(|job| job.status == JobStatus::Pending).collect();
        assert_eq!(completed, 1);
        assert_eq!(returned.len(), 2);
        assert!(returned.iter().all(|job| job.run_at <= clock.now_utc() && job.locked_until.is_none()));
    }
}

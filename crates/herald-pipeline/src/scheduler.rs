//! Periodic job publisher.
//!
//! Publishes the global delivery sweep and the maintenance job at fixed
//! intervals while the workers hold the lease. Publish failures are logged
//! and retried on the next tick.

use std::{sync::Arc, time::Duration};

use herald_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{DeliveryStatusJob, Job, JobQueue, ReconciliationJob};

/// Scheduler intervals.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Interval of the global `delivery-status-update {}` sweep.
    pub delivery_sweep_interval: Duration,
    /// Interval of the `reconciliation {}` maintenance job.
    pub maintenance_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            delivery_sweep_interval: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

/// Publishes recurring jobs until cancelled.
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    cancellation_token: CancellationToken,
}

impl Scheduler {
    /// Creates a new scheduler.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { queue, clock, settings, cancellation_token }
    }

    /// Runs until the cancellation token fires. Both jobs are published
    /// once immediately, then on their intervals.
    pub async fn run(&self) {
        info!(
            delivery_sweep_secs = self.settings.delivery_sweep_interval.as_secs(),
            maintenance_secs = self.settings.maintenance_interval.as_secs(),
            "scheduler starting"
        );

        let mut next_sweep = self.clock.now();
        let mut next_maintenance = self.clock.now();

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let now = self.clock.now();
            if now >= next_sweep {
                self.publish(Job::DeliveryStatusUpdate(DeliveryStatusJob::default())).await;
                next_sweep = now + self.settings.delivery_sweep_interval;
            }
            if now >= next_maintenance {
                self.publish(Job::Reconciliation(ReconciliationJob::default())).await;
                next_maintenance = now + self.settings.maintenance_interval;
            }

            let wait = next_sweep.min(next_maintenance).saturating_duration_since(self.clock.now());
            tokio::select! {
                () = self.clock.sleep(wait) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!("scheduler stopped");
    }

    async fn publish(&self, job: Job) {
        let queue = job.queue();
        match self.queue.publish(job, self.clock.now_utc()).await {
            Ok(job_id) => debug!(queue = %queue, job_id = %job_id, "scheduled job published"),
            Err(err) => warn!(queue = %queue, error = %err, "failed to publish scheduled job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;

    use super::*;
    use crate::{queue::QueueName, storage::mock::MemoryBackend};

    #[tokio::test]
    async fn publishes_both_jobs_until_cancelled() {
        let clock = Arc::new(TestClock::new());
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let token = CancellationToken::new();
        let scheduler = Scheduler::new(
            backend.clone(),
            clock.clone(),
            SchedulerSettings {
                delivery_sweep_interval: Duration::from_secs(60),
                maintenance_interval: Duration::from_secs(120),
            },
            token.clone(),
        );

        let handle = tokio::spawn(async move { scheduler.run().await });
        while backend.jobs(QueueName::Reconciliation).await.len() < 2 {
            tokio::task::yield_now().await;
        }
        token.cancel();
        handle.await.unwrap();

        let sweeps = backend.jobs(QueueName::DeliveryStatusUpdate).await.len();
        let maintenance = backend.jobs(QueueName::Reconciliation).await.len();
        assert!(sweeps >= 3, "sweeps run twice as often: {sweeps}");
        assert!(maintenance >= 2);
    }
}

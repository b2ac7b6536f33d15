//! Worker pool management with structured concurrency.
//!
//! Spawns the queue workers and the scheduler as supervised tasks sharing
//! one cancellation token, and joins them on graceful shutdown.

use std::{future::Future, sync::Arc, time::Duration};

use herald_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::EngineStats,
    error::{PipelineError, Result},
    queue::{HandlerTable, JobQueue, QueueName},
    worker::{QueueWorker, WorkerSettings},
};

/// Supervised set of pipeline tasks.
pub struct WorkerPool {
    jobs: Arc<dyn JobQueue>,
    handlers: Arc<HandlerTable>,
    settings: WorkerSettings,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(
        jobs: Arc<dyn JobQueue>,
        handlers: Arc<HandlerTable>,
        settings: WorkerSettings,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            handlers,
            settings,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns `count` workers for each `(queue, count)` pair.
    pub async fn spawn_workers(&mut self, plan: &[(QueueName, usize)]) {
        let total: usize = plan.iter().map(|(_, count)| count).sum();
        info!(worker_count = total, "spawning queue workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers += total;
        }

        for &(queue, count) in plan {
            for _ in 0..count {
                let worker_id = self.worker_handles.len();
                let worker = QueueWorker::new(
                    worker_id,
                    queue,
                    self.jobs.clone(),
                    self.handlers.clone(),
                    self.settings.clone(),
                    self.stats.clone(),
                    self.cancellation_token.clone(),
                    self.clock.clone(),
                );

                let handle = tokio::spawn(async move {
                    let result = worker.run().await;
                    if let Err(ref err) = result {
                        error!(worker_id, queue = %queue, error = %err, "queue worker terminated with error");
                    }
                    result
                });
                self.worker_handles.push(handle);
            }
        }

        info!(spawned_workers = self.worker_handles.len(), "queue workers spawned");
    }

    /// Spawns an auxiliary task, such as the scheduler, that stops with the
    /// pool.
    pub fn spawn_task<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            task.await;
            info!(task = name, "pool task stopped");
            Ok(())
        });
        self.worker_handles.push(handle);
    }

    /// Cancels every task and waits up to `timeout` for them to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if tasks are still running at the deadline.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown = async move {
            let results = futures::future::join_all(handles).await;
            let mut panicked = 0;
            for (worker_id, result) in results.into_iter().enumerate() {
                match result {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => {
                        warn!(worker_id, error = %err, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                        panicked += 1;
                    },
                }
            }
            stats.write().await.active_workers = 0;
            panicked
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(0) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(panicked) => {
                warn!(panicked, "worker pool shut down with panicked workers");
                Ok(())
            },
            Err(_) => {
                error!(timeout_seconds = timeout.as_secs(), "worker shutdown timed out");
                Err(PipelineError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }

    /// Returns true if any task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|handle| !handle.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(active_workers = active, "worker pool dropped without shutdown, cancelling tasks");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;

    use super::*;
    use crate::storage::mock::MemoryBackend;

    fn pool(stats: Arc<RwLock<EngineStats>>) -> WorkerPool {
        let clock = Arc::new(TestClock::new());
        WorkerPool::new(
            Arc::new(MemoryBackend::new(clock.clone())),
            Arc::new(HandlerTable::new()),
            WorkerSettings::default(),
            stats,
            CancellationToken::new(),
            clock,
        )
    }

    #[tokio::test]
    async fn spawns_planned_workers_and_shuts_down() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let mut pool = pool(stats.clone());

        pool.spawn_workers(&[(QueueName::SmsSend, 3), (QueueName::CampaignSend, 1)]).await;
        assert_eq!(pool.worker_handles.len(), 4);
        assert_eq!(stats.read().await.active_workers, 4);

        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn empty_pool_shuts_down_immediately() {
        let pool = pool(Arc::new(RwLock::new(EngineStats::default())));
        assert!(!pool.has_active_workers());
        pool.shutdown_graceful(Duration::from_millis(1)).await.unwrap();
    }
}

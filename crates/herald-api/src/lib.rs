//! Herald HTTP API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::sync::Arc;

pub use config::{Config, WorkerMode};
use herald_core::Clock;
use herald_pipeline::{
    CampaignService, EngineStats, EnqueueService, PipelineEngine, PipelineStorage, WorkerLock,
};
pub use server::{create_router, start_server};
use tokio::sync::RwLock;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Enqueue gateway.
    pub enqueue: Arc<EnqueueService>,
    /// Pause, resume, reconcile and status.
    pub campaigns: Arc<CampaignService>,
    /// Storage probed by the health checks.
    pub storage: Arc<dyn PipelineStorage>,
    /// Time source for health timestamps.
    pub clock: Arc<dyn Clock>,
    /// Worker statistics of this process.
    pub engine_stats: Arc<RwLock<EngineStats>>,
    /// Worker lock, when this process competes for it.
    pub worker_lock: Option<Arc<WorkerLock>>,
}

impl AppState {
    /// Builds the state from an engine's services.
    pub fn new(engine: &PipelineEngine, clock: Arc<dyn Clock>) -> Self {
        Self {
            enqueue: engine.enqueue_service(),
            campaigns: engine.campaign_service(),
            storage: engine.backends().storage.clone(),
            clock,
            engine_stats: engine.stats_handle(),
            worker_lock: None,
        }
    }

    /// Reports `lock` on the worker status endpoint.
    #[must_use]
    pub fn with_worker_lock(mut self, lock: Arc<WorkerLock>) -> Self {
        self.worker_lock = Some(lock);
        self
    }
}

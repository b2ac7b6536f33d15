//! Deterministic test harness for the campaign pipeline.
//!
//! [`TestHarness`] wires a [`PipelineEngine`] to the in-memory backend, a
//! scripted SMS provider and a virtual clock. Tests step the queues
//! explicitly instead of starting worker tasks, so every run is
//! reproducible: retries and delivery polls become due only when the test
//! advances the clock.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use herald_core::{Campaign, CampaignId, Clock, Contact, HeraldError, OwnerId};
use herald_pipeline::{
    provider::mock::ScriptedProvider, EnqueueOutcome, MemoryBackend, PipelineBackends,
    PipelineConfig, PipelineEngine, QueueName,
};

pub mod fixtures;
pub mod invariants;

pub use fixtures::{CampaignBuilder, ContactBuilder};
pub use herald_core::TestClock;
pub use herald_pipeline::storage::mock::FailPoint;

/// Upper bound on queue passes before a test is declared stuck.
const MAX_STEPS: usize = 10_000;

/// In-memory pipeline with a virtual clock.
pub struct TestHarness {
    /// Virtual clock shared by every component.
    pub clock: TestClock,
    /// Storage, queue and ledger.
    pub backend: Arc<MemoryBackend>,
    /// Scripted SMS provider.
    pub provider: ScriptedProvider,
    engine: PipelineEngine,
}

impl TestHarness {
    /// Creates a harness with [`TestHarness::default_config`].
    pub fn new() -> Self {
        Self::with_config(Self::default_config())
    }

    /// Creates a harness with a custom pipeline configuration.
    pub fn with_config(config: PipelineConfig) -> Self {
        init_tracing();

        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let backend = Arc::new(MemoryBackend::new(shared.clone()));
        let provider = ScriptedProvider::new();
        let engine = PipelineEngine::new(
            PipelineBackends::memory(backend.clone()),
            Arc::new(provider.clone()),
            shared,
            config,
        );

        Self { clock, backend, provider, engine }
    }

    /// Pipeline defaults with larger batches and a fast rate limit.
    pub fn default_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.worker.batch_size = 100;
        config.fanout.batch_size = 50;
        config.sms_rate_per_second = 1_000;
        config
    }

    /// The engine under test.
    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    /// Creates an owner holding `credits`.
    pub async fn owner_with_credits(&self, credits: i64) -> OwnerId {
        let owner_id = OwnerId::new();
        self.backend.credit(owner_id, credits).await;
        owner_id
    }

    /// Stores `count` contacts for `owner_id` carrying `tags`.
    pub async fn add_contacts(&self, owner_id: OwnerId, count: usize, tags: &[&str]) -> Vec<Contact> {
        let mut contacts = Vec::with_capacity(count);
        for _ in 0..count {
            let contact = ContactBuilder::new(owner_id).tags(tags).build(self.clock.now_utc());
            self.backend.insert_contact(contact.clone()).await;
            contacts.push(contact);
        }
        contacts
    }

    /// Stores a built contact.
    pub async fn add_contact(&self, contact: ContactBuilder) -> Contact {
        let contact = contact.build(self.clock.now_utc());
        self.backend.insert_contact(contact.clone()).await;
        contact
    }

    /// Stores a built campaign.
    pub async fn add_campaign(&self, campaign: CampaignBuilder) -> Campaign {
        let campaign = campaign.build(self.clock.now_utc());
        self.backend.insert_campaign(campaign.clone()).await;
        campaign
    }

    /// Stores a draft campaign for `owner_id` targeting `tags`.
    pub async fn draft_campaign(&self, owner_id: OwnerId, tags: &[&str]) -> Campaign {
        self.add_campaign(CampaignBuilder::new(owner_id).audience(tags)).await
    }

    /// Enqueues a campaign through the gateway.
    ///
    /// # Errors
    ///
    /// Whatever the enqueue gateway rejects the request with.
    pub async fn enqueue(
        &self,
        campaign_id: CampaignId,
        idempotency_key: &str,
    ) -> std::result::Result<EnqueueOutcome, HeraldError> {
        self.engine.enqueue_service().enqueue(campaign_id, idempotency_key).await
    }

    /// Current copy of a campaign.
    ///
    /// # Errors
    ///
    /// Returns error if the campaign does not exist.
    pub async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.backend.campaign(id).await.ok_or_else(|| anyhow::anyhow!("campaign {id} not found"))
    }

    /// Runs one batch of `queue`.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn run_queue(&self, queue: QueueName) -> Result<usize> {
        Ok(self.engine.run_queue_once(queue).await?)
    }

    /// Runs every queue until a full pass claims nothing. Jobs scheduled in
    /// the future stay pending.
    ///
    /// # Errors
    ///
    /// Returns error if a claim fails or the queues never settle.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_STEPS {
            let mut claimed = 0;
            for queue in QueueName::ALL {
                claimed += self.run_queue(queue).await?;
            }
            if claimed == 0 {
                return Ok(total);
            }
            total += claimed;
        }
        bail!("queues did not drain after {MAX_STEPS} passes")
    }

    /// Drains, then jumps the clock to the next scheduled job, until no
    /// pending job remains.
    ///
    /// # Errors
    ///
    /// Returns error if a claim fails or jobs keep rescheduling forever.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_STEPS {
            total += self.drain().await?;
            match self.backend.next_run_at().await {
                Some(run_at) => self.clock.advance_to(run_at),
                None => return Ok(total),
            }
        }
        bail!("pipeline still busy after {MAX_STEPS} clock jumps")
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Current virtual time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}

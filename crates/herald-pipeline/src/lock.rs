//! Distributed worker lock.
//!
//! Only one process per service and environment may run queue consumers.
//! The lock is a lease with a random token and a TTL; the holder refreshes
//! it in the background and the lease lapses on its own if the holder dies.
//! A process that fails to acquire the lease keeps serving HTTP but starts
//! no workers.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{storage::Storage, Clock, LeaseInfo};
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{PipelineError, Result},
    queue::BoxFuture,
};

/// Lease storage.
pub trait LeaseStore: Send + Sync + 'static {
    /// Takes the lease for `token` if it is absent or expired.
    fn try_acquire(&self, key: String, token: String, ttl: Duration)
        -> BoxFuture<'_, herald_core::Result<bool>>;

    /// Extends the lease if `token` still holds it.
    fn refresh(&self, key: String, token: String, ttl: Duration)
        -> BoxFuture<'_, herald_core::Result<bool>>;

    /// Deletes the lease if `token` still holds it.
    fn release(&self, key: String, token: String) -> BoxFuture<'_, herald_core::Result<bool>>;

    /// Reads the current lease.
    fn inspect(&self, key: String) -> BoxFuture<'_, herald_core::Result<Option<LeaseInfo>>>;
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Lease store backed by the `worker_locks` table.
pub struct PostgresLeaseStore {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresLeaseStore {
    /// Creates a new PostgreSQL lease store.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl LeaseStore for PostgresLeaseStore {
    fn try_acquire(
        &self,
        key: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'_, herald_core::Result<bool>> {
        let now = self.clock.now_utc();
        Box::pin(async move {
            self.storage.worker_locks.try_acquire(&key, &token, expiry(now, ttl), now).await
        })
    }

    fn refresh(
        &self,
        key: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'_, herald_core::Result<bool>> {
        let now = self.clock.now_utc();
        Box::pin(async move { self.storage.worker_locks.refresh(&key, &token, expiry(now, ttl)).await })
    }

    fn release(&self, key: String, token: String) -> BoxFuture<'_, herald_core::Result<bool>> {
        Box::pin(async move { self.storage.worker_locks.release(&key, &token).await })
    }

    fn inspect(&self, key: String) -> BoxFuture<'_, herald_core::Result<Option<LeaseInfo>>> {
        Box::pin(async move { self.storage.worker_locks.inspect(&key).await })
    }
}

/// Worker lock configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Service name in the lock key.
    pub service: String,
    /// Environment name in the lock key.
    pub environment: String,
    /// Lease lifetime.
    pub ttl: Duration,
    /// How often the holder extends the lease.
    pub refresh_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            service: "herald".to_string(),
            environment: "development".to_string(),
            ttl: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    /// Namespaced lock key.
    pub fn key(&self) -> String {
        format!("locks:workers:{}:{}", self.service, self.environment)
    }
}

/// Snapshot of the lock for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    /// Lock key.
    pub key: String,
    /// Whether any process holds the lease.
    pub exists: bool,
    /// Remaining lease time in milliseconds.
    pub ttl_ms: Option<i64>,
    /// Whether this process is the holder.
    pub owned_by_this_process: bool,
}

/// Leader lock for queue consumers.
pub struct WorkerLock {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    clock: Arc<dyn Clock>,
    held_token: Arc<RwLock<Option<String>>>,
}

impl WorkerLock {
    /// Creates a lock over `store`.
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock, held_token: Arc::new(RwLock::new(None)) }
    }

    /// Lock key.
    pub fn key(&self) -> String {
        self.config.key()
    }

    /// Tries to take the lease. Returns `None` if another process holds it.
    ///
    /// On success the returned guard keeps the lease alive until it is
    /// released, dropped, or lost.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Lock` if the lease store fails.
    pub async fn acquire(&self) -> Result<Option<LeaseGuard>> {
        let key = self.key();
        let token = new_token();

        let acquired = self
            .store
            .try_acquire(key.clone(), token.clone(), self.config.ttl)
            .await
            .map_err(|e| PipelineError::lock(e.to_string()))?;

        if !acquired {
            info!(lock_key = %key, "worker lock held by another process");
            return Ok(None);
        }

        *self.held_token.write().await = Some(token.clone());
        info!(lock_key = %key, ttl_secs = self.config.ttl.as_secs(), "worker lock acquired");

        Ok(Some(LeaseGuard::start(
            self.store.clone(),
            self.clock.clone(),
            self.config.clone(),
            key,
            token,
            self.held_token.clone(),
        )))
    }

    /// Reports who holds the lease and for how long.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Lock` if the lease store fails.
    pub async fn status(&self) -> Result<LockStatus> {
        let key = self.key();
        let lease = self
            .store
            .inspect(key.clone())
            .await
            .map_err(|e| PipelineError::lock(e.to_string()))?;
        let now = self.clock.now_utc();

        let Some(lease) = lease.filter(|lease| lease.expires_at > now) else {
            return Ok(LockStatus { key, exists: false, ttl_ms: None, owned_by_this_process: false });
        };

        let held = self.held_token.read().await;
        Ok(LockStatus {
            key,
            exists: true,
            ttl_ms: Some((lease.expires_at - now).num_milliseconds()),
            owned_by_this_process: held.as_deref() == Some(lease.token.as_str()),
        })
    }
}

/// Random 128-bit hex token.
fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Held lease with a background refresh loop.
///
/// Dropping the guard stops refreshing without deleting the lease, which
/// then lapses after its TTL, the same as a crashed holder.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    key: String,
    token: String,
    held_token: Arc<RwLock<Option<String>>>,
    stop: CancellationToken,
    lost: CancellationToken,
    refresh_task: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    fn start(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: LockConfig,
        key: String,
        token: String,
        held_token: Arc<RwLock<Option<String>>>,
    ) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();

        let refresh_task = tokio::spawn(refresh_loop(
            store.clone(),
            clock,
            config,
            key.clone(),
            token.clone(),
            held_token.clone(),
            stop.clone(),
            lost.clone(),
        ));

        Self { store, key, token, held_token, stop, lost, refresh_task: Some(refresh_task) }
    }

    /// Token identifying this holder.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Cancelled when a refresh finds the lease no longer ours.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Whether the lease has been lost.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stops refreshing and deletes the lease if we still hold it.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Lock` if the lease store fails.
    pub async fn release(mut self) -> Result<bool> {
        self.stop.cancel();
        if let Some(task) = self.refresh_task.take() {
            let _ = task.await;
        }

        let released = self
            .store
            .release(self.key.clone(), self.token.clone())
            .await
            .map_err(|e| PipelineError::lock(e.to_string()))?;

        let mut held = self.held_token.write().await;
        if held.as_deref() == Some(self.token.as_str()) {
            *held = None;
        }

        info!(lock_key = %self.key, released, "worker lock released");
        Ok(released)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn refresh_loop(
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
    key: String,
    token: String,
    held_token: Arc<RwLock<Option<String>>>,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let ttl = chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::MAX);
    let mut last_refreshed = clock.now_utc();

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            () = clock.sleep(config.refresh_interval) => {},
        }
        if stop.is_cancelled() {
            break;
        }

        match store.refresh(key.clone(), token.clone(), config.ttl).await {
            Ok(true) => {
                last_refreshed = clock.now_utc();
                debug!(lock_key = %key, "worker lock refreshed");
                continue;
            },
            Ok(false) => warn!(lock_key = %key, "worker lock lost to another holder"),
            Err(e) => {
                let since = clock.now_utc() - last_refreshed;
                if since < ttl {
                    warn!(lock_key = %key, error = %e, "worker lock refresh failed");
                    continue;
                }
                warn!(
                    lock_key = %key,
                    error = %e,
                    unrefreshed_ms = since.num_milliseconds(),
                    "worker lock refresh failing past its ttl, treating lease as lost"
                );
            },
        }

        let mut held = held_token.write().await;
        if held.as_deref() == Some(token.as_str()) {
            *held = None;
        }
        lost.cancel();
        break;
    }
}

pub mod mock {
    //! In-memory lease store driven by a `Clock`.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use herald_core::{Clock, CoreError, LeaseInfo};
    use tokio::sync::RwLock;

    use super::{expiry, LeaseStore};
    use crate::queue::BoxFuture;

    /// Lease store shared by every `WorkerLock` that clones it, standing in
    /// for the database that separate processes would share.
    #[derive(Clone)]
    pub struct MemoryLeaseStore {
        leases: Arc<RwLock<HashMap<String, LeaseInfo>>>,
        unreachable: Arc<AtomicBool>,
        clock: Arc<dyn Clock>,
    }

    impl MemoryLeaseStore {
        /// Creates an empty store.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                leases: Arc::new(RwLock::new(HashMap::new())),
                unreachable: Arc::new(AtomicBool::new(false)),
                clock,
            }
        }

        /// Makes refreshes fail with a database error until cleared.
        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Overwrites the lease as if another holder had taken it.
        pub async fn steal(&self, key: &str, token: &str, ttl: Duration) {
            let expires_at = expiry(self.clock.now_utc(), ttl);
            self.leases.write().await.insert(
                key.to_string(),
                LeaseInfo { key: key.to_string(), token: token.to_string(), expires_at },
            );
        }
    }

    impl LeaseStore for MemoryLeaseStore {
        fn try_acquire(
            &self,
            key: String,
            token: String,
            ttl: Duration,
        ) -> BoxFuture<'_, herald_core::Result<bool>> {
            Box::pin(async move {
                let now = self.clock.now_utc();
                let mut leases = self.leases.write().await;
                if leases.get(&key).is_some_and(|lease| lease.expires_at > now) {
                    return Ok(false);
                }
                leases.insert(key.clone(), LeaseInfo { key, token, expires_at: expiry(now, ttl) });
                Ok(true)
            })
        }

        fn refresh(
            &self,
            key: String,
            token: String,
            ttl: Duration,
        ) -> BoxFuture<'_, herald_core::Result<bool>> {
            Box::pin(async move {
                if self.unreachable.load(Ordering::SeqCst) {
                    return Err(CoreError::Database("lease store unreachable".to_string()));
                }
                let now = self.clock.now_utc();
                let mut leases = self.leases.write().await;
                match leases.get_mut(&key) {
                    Some(lease) if lease.token == token => {
                        lease.expires_at = expiry(now, ttl);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn release(&self, key: String, token: String) -> BoxFuture<'_, herald_core::Result<bool>> {
            Box::pin(async move {
                let mut leases = self.leases.write().await;
                if leases.get(&key).is_some_and(|lease| lease.token == token) {
                    leases.remove(&key);
                    return Ok(true);
                }
                Ok(false)
            })
        }

        fn inspect(&self, key: String) -> BoxFuture<'_, herald_core::Result<Option<LeaseInfo>>> {
            Box::pin(async move { Ok(self.leases.read().await.get(&key).cloned()) })
        }
    }
}

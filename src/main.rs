//! Herald bulk SMS campaign service.
//!
//! Main entry point. Serves the HTTP API and, with `worker_mode =
//! embedded`, runs the queue workers once this process holds the worker
//! lock.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{server, AppState, Config};
use herald_core::{storage::Storage, Clock, RealClock};
use herald_pipeline::{
    HttpSmsProvider, PipelineBackends, PipelineEngine, PostgresLeaseStore, ProviderConfig,
    WorkerLock,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often a standby process retries the worker lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        worker_mode = ?config.worker_mode,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));

    // API-only deployments never send, but the engine still owns the
    // enqueue and campaign services.
    let provider_config = config.to_provider_config().unwrap_or_else(|_| ProviderConfig::default());
    let provider = Arc::new(HttpSmsProvider::new(provider_config).context("Failed to build SMS provider")?);

    let engine = PipelineEngine::new(
        PipelineBackends::postgres(storage.clone(), clock.clone()),
        provider,
        clock.clone(),
        config.to_pipeline_config(),
    );

    let lock = Arc::new(WorkerLock::new(
        Arc::new(PostgresLeaseStore::new(storage, clock.clone())),
        config.to_lock_config(),
        clock.clone(),
    ));

    let state = AppState::new(&engine, clock).with_worker_lock(lock.clone());

    let shutdown = CancellationToken::new();
    let workers = if config.workers_enabled() {
        Some(tokio::spawn(run_workers(engine, lock, shutdown.clone())))
    } else {
        info!("worker_mode is disabled, serving the API only");
        None
    };

    let addr = config.parse_server_addr()?;
    let request_timeout = Duration::from_secs(config.request_timeout);
    if let Err(e) = server::start_server(state, addr, request_timeout).await {
        error!(error = %e, "Server failed");
    }

    shutdown.cancel();
    if let Some(workers) = workers {
        match tokio::time::timeout(Duration::from_secs(config.request_timeout), workers).await {
            Ok(Ok(Ok(()))) => info!("Queue workers stopped"),
            Ok(Ok(Err(e))) => error!(error = %e, "Queue workers stopped with error"),
            Ok(Err(e)) => error!(error = %e, "Queue worker supervisor panicked"),
            Err(_) => warn!("Queue workers did not stop before the grace period expired"),
        }
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Herald shutdown complete");
    Ok(())
}

/// Waits for the worker lock, runs the engine while holding it, and stops
/// on shutdown or when the lease is lost.
async fn run_workers(
    mut engine: PipelineEngine,
    lock: Arc<WorkerLock>,
    shutdown: CancellationToken,
) -> Result<()> {
    let guard = loop {
        match lock.acquire().await {
            Ok(Some(guard)) => break guard,
            Ok(None) => info!(lock_key = %lock.key(), "standing by for worker lock"),
            Err(e) => warn!(error = %e, "worker lock acquire failed"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(LOCK_RETRY_INTERVAL) => {},
        }
    };

    engine.start().await.context("Failed to start pipeline engine")?;

    let lost = guard.lost();
    tokio::select! {
        () = shutdown.cancelled() => info!("Stopping queue workers"),
        () = lost.cancelled() => error!(lock_key = %lock.key(), "Worker lock lost, stopping queue workers"),
    }

    engine.shutdown().await.context("Pipeline engine shutdown failed")?;
    guard.release().await.context("Failed to release worker lock")?;
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the schema if it does not exist.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    // TODO: move to sqlx::migrate! with versioned files once the schema
    // needs its first ALTER.
    const STATEMENTS: &[(&str, &str)] = &[
        (
            "contacts table",
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id UUID PRIMARY KEY,
                owner_id UUID NOT NULL,
                phone TEXT NOT NULL,
                tags TEXT[] NOT NULL DEFAULT '{}',
                opted_out BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ),
        (
            "campaigns table",
            r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id UUID PRIMARY KEY,
                owner_id UUID NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                audience TEXT[] NOT NULL DEFAULT '{}',
                body TEXT NOT NULL,
                scheduled_at TIMESTAMPTZ,
                total_recipients INTEGER NOT NULL DEFAULT 0,
                reservation_id UUID,
                fanout_completed_at TIMESTAMPTZ,
                last_reconcile_requested_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ),
        (
            "recipient_messages table",
            r#"
            CREATE TABLE IF NOT EXISTS recipient_messages (
                id UUID PRIMARY KEY,
                campaign_id UUID NOT NULL REFERENCES campaigns(id),
                contact_id UUID NOT NULL,
                phone TEXT NOT NULL,
                status TEXT NOT NULL,
                provider_message_id TEXT,
                credits_charged INTEGER NOT NULL DEFAULT 0,
                send_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                accepted_at TIMESTAMPTZ,
                UNIQUE(campaign_id, contact_id)
            )
            "#,
        ),
        (
            "credit_balances table",
            r#"
            CREATE TABLE IF NOT EXISTS credit_balances (
                owner_id UUID PRIMARY KEY,
                balance BIGINT NOT NULL DEFAULT 0,
                reserved BIGINT NOT NULL DEFAULT 0,
                CHECK (reserved >= 0)
            )
            "#,
        ),
        (
            "credit_reservations table",
            r#"
            CREATE TABLE IF NOT EXISTS credit_reservations (
                id UUID PRIMARY KEY,
                owner_id UUID NOT NULL,
                reservation_key TEXT NOT NULL,
                amount BIGINT NOT NULL,
                committed BIGINT NOT NULL DEFAULT 0,
                released BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ NOT NULL,
                CHECK (committed + released <= amount)
            )
            "#,
        ),
        (
            "credit_settlements table",
            r#"
            CREATE TABLE IF NOT EXISTS credit_settlements (
                reservation_id UUID NOT NULL REFERENCES credit_reservations(id),
                slice_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (reservation_id, slice_key)
            )
            "#,
        ),
        (
            "campaign_idempotency table",
            r#"
            CREATE TABLE IF NOT EXISTS campaign_idempotency (
                campaign_id UUID NOT NULL REFERENCES campaigns(id),
                idempotency_key TEXT NOT NULL,
                queued INTEGER NOT NULL,
                reservation_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (campaign_id, idempotency_key)
            )
            "#,
        ),
        (
            "jobs table",
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                queue TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                run_at TIMESTAMPTZ NOT NULL,
                locked_until TIMESTAMPTZ,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ),
        (
            "worker_locks table",
            r#"
            CREATE TABLE IF NOT EXISTS worker_locks (
                key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ),
        (
            "contacts audience index",
            r#"
            CREATE INDEX IF NOT EXISTS idx_contacts_owner
            ON contacts(owner_id, id)
            WHERE NOT opted_out
            "#,
        ),
        (
            "contacts tags index",
            "CREATE INDEX IF NOT EXISTS idx_contacts_tags ON contacts USING GIN (tags)",
        ),
        (
            "active reservation key index",
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_reservations_active_key
            ON credit_reservations(reservation_key)
            WHERE status = 'active'
            "#,
        ),
        (
            "recipient status index",
            r#"
            CREATE INDEX IF NOT EXISTS idx_recipient_messages_accepted
            ON recipient_messages(campaign_id, id)
            WHERE status = 'accepted'
            "#,
        ),
        (
            "jobs claim index",
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(queue, run_at)
            WHERE status IN ('pending', 'running')
            "#,
        ),
    ];

    for (name, sql) in STATEMENTS {
        sqlx::query(sql).execute(pool).await.with_context(|| format!("Failed to create {name}"))?;
    }

    Ok(())
}

//! Sessionward Background Worker
//!
//! Handles scheduled jobs:
//! - Purge of expired refresh-session records (`SESSION_PURGE_CRON`, hourly by default)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use sessionward_api::auth::store::{PgSessionStore, SessionStore};
use sessionward_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

const DEFAULT_PURGE_CRON: &str = "0 0 * * * *";

async fn purge_expired_sessions(store: &dyn SessionStore) {
    let started = std::time::Instant::now();
    match store.purge_expired(OffsetDateTime::now_utc()).await {
        Ok(purged) => info!(
            purged,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Expired refresh sessions purged"
        ),
        Err(e) => error!(error = %e, "Failed to purge expired refresh sessions"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Sessionward Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool));
    let purge_cron =
        std::env::var("SESSION_PURGE_CRON").unwrap_or_else(|_| DEFAULT_PURGE_CRON.to_string());

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Purge refresh sessions past their expiry
    let purge_store = store.clone();
    scheduler
        .add(Job::new_async(purge_cron.as_str(), move |_uuid, _l| {
            let store = purge_store.clone();
            Box::pin(async move {
                info!("Running expired session purge");
                purge_expired_sessions(store.as_ref()).await;
            })
        })?)
        .await?;
    info!(cron = %purge_cron, "Scheduled: Expired session purge");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Purge once at startup so a long-stopped worker catches up
    purge_expired_sessions(store.as_ref()).await;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Sessionward Worker started successfully with 2 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}

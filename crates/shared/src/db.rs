//! Postgres pool creation and embedded migrations

use std::time::Duration;

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Migrations for `users`, `user_profiles` and `refresh_sessions`
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MAX_CONNECT_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("Failed to run migrations: {0}")]
    Migrate(#[from] MigrateError),
}

/// Create a connection pool, retrying the initial connect with exponential backoff
pub async fn create_pool(database_url: &str) -> Result<PgPool, DbError> {
    let strategy = ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(MAX_CONNECT_ATTEMPTS);

    let pool = Retry::spawn(strategy, || async {
        PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Database connection attempt failed"))
    })
    .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Apply all pending migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    MIGRATOR.run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

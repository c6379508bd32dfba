//! Library Loans worker
//!
//! Connects the loan engine to Postgres and Redis, applies migrations and runs
//! the overdue report until interrupted. Request handling lives in the
//! surrounding service, which embeds the library crate.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use library_loans::{
    clock::SystemClock,
    config::AppConfig,
    logging, report,
    repository::Repository,
    services::{redis::RedisService, Services},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let _log_guard = logging::init(&config.logging);

    tracing::info!("Starting Library Loans v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Loan policy: {} day period, fine {} per day, {} active loans max, renewals {}",
        config.loans.loan_period_days,
        config.loans.daily_fine_rate,
        config.loans.max_active_loans,
        config
            .loans
            .max_renewals
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Connected to database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database migrations completed");

    let redis = RedisService::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;

    tracing::info!("Connected to Redis");

    let repository = Repository::new(pool, config.database.lock_timeout_ms);
    let services = Services::new(Arc::new(repository), Arc::new(redis), Arc::new(SystemClock), &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = tokio::spawn(report::run(
        services.loans.clone(),
        services.notifications.clone(),
        Duration::from_secs(config.reporting.overdue_interval_seconds.max(1)),
        config.reporting.page_size,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    shutdown_tx.send(true).ok();
    reporter.await.context("Overdue report task panicked")?;

    Ok(())
}

//! Live Snapshot Agent
//!
//! Operator entry point for live dashboard snapshots: freshness checks that
//! trigger refreshes, and the expiry sweep.

mod config;
mod lifecycle;

use std::sync::Arc;

use clap::Parser;
use live_snapshots::clock::{Clock, SystemClock};
use live_snapshots::coordinator::{ERROR_RETRY_SECS, StalenessCoordinator, cache_interval};
use live_snapshots::notifier::RefreshWorker;
use live_snapshots::storage::SnapshotStore;
use live_snapshots::storage::sqlite::SqliteStore;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Command, Config};

/// Application state shared across tasks
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub clock: Arc<dyn Clock>,
    pub coordinator: StalenessCoordinator,
    pub config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snapshot_agent=debug,live_snapshots=debug".into()),
        )
        .init();

    // Parse CLI args
    let config = Config::parse();

    // Initialize database
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        SqliteStore::new(&config.db_path)
            .await?
            .with_clock(clock.clone()),
    );
    store.ensure_table().await?;

    // Start the refresh worker; it stops once the coordinator is dropped
    let http = reqwest::Client::builder().build()?;
    let (notifier, refresh_worker) = RefreshWorker::spawn(http, config.webhook());

    let coordinator =
        StalenessCoordinator::new(store.clone(), Arc::new(notifier), clock.clone());

    let state = Arc::new(AppState {
        store,
        clock,
        coordinator,
        config: config.clone(),
    });

    match config.command {
        Command::Check { key } => {
            let outcome = check(&state, &key).await;
            drop(state);
            refresh_worker.await?;
            outcome?;
        }
        Command::Sweep {
            cleanup_interval,
            remove_expired,
            once,
        } => {
            if once {
                lifecycle::sweep_once(state.store.as_ref(), state.clock.as_ref(), remove_expired)
                    .await?;
                return Ok(());
            }

            let interval = std::time::Duration::from_secs(cleanup_interval);
            let cleanup_state = Arc::clone(&state);
            let cleanup = tokio::spawn(async move {
                lifecycle::cleanup_task(cleanup_state, interval, remove_expired).await;
            });

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            cleanup.abort();
        }
    }

    Ok(())
}

/// Evaluate one snapshot and print the cache interval callers should use
async fn check(state: &AppState, key: &str) -> anyhow::Result<()> {
    let snapshot = state.store.get(key).await?;

    match cache_interval(
        &state.coordinator,
        &snapshot,
        state.config.staleness_window(),
    )
    .await
    {
        Ok(max_age) => {
            println!(
                "{}",
                json!({ "key": key, "live": snapshot.is_live(), "maxAge": max_age })
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "Failed to get update status for live dashboard snapshot {}: {}",
                key, e
            );
            println!(
                "{}",
                json!({
                    "key": key,
                    "live": snapshot.is_live(),
                    "maxAge": ERROR_RETRY_SECS,
                    "error": e.to_string(),
                    "retryable": e.is_retryable(),
                })
            );
            Err(e.into())
        }
    }
}

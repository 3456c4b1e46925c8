//! Agent configuration

use std::time::Duration;

use clap::{Parser, Subcommand};
use live_snapshots::notifier::WebhookConfig;

/// Live snapshot refresh agent
#[derive(Parser, Clone, Debug)]
#[command(name = "snapshot-agent")]
#[command(about = "Checks live dashboard snapshots and sweeps expired ones")]
pub struct Config {
    /// Path to SQLite database
    #[arg(long, default_value = "snapshots.db")]
    pub db_path: String,

    /// Seconds after which a live snapshot is stale
    #[arg(long, default_value = "60")]
    pub staleness_window: u64,

    /// Refresh endpoint that re-renders live snapshots
    #[arg(long, env = "LIVE_SNAPSHOT_REFRESH_URL")]
    pub refresh_url: Option<String>,

    /// Security header name sent to the refresh endpoint
    #[arg(long, env = "LIVE_SNAPSHOT_REFRESH_HEADER_NAME")]
    pub refresh_header_name: Option<String>,

    /// Security header value sent to the refresh endpoint
    #[arg(long, env = "LIVE_SNAPSHOT_REFRESH_HEADER_VALUE", hide_env_values = true)]
    pub refresh_header_value: Option<String>,

    /// Refresh requests queued before new ones are dropped
    #[arg(long, default_value = "256")]
    pub refresh_queue: usize,

    /// Refresh requests in flight at once
    #[arg(long, default_value = "4")]
    pub refresh_concurrency: usize,

    /// Refresh request timeout in seconds
    #[arg(long, default_value = "10")]
    pub refresh_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Evaluate a snapshot's freshness and print the cache interval
    Check {
        /// Snapshot key
        key: String,
    },

    /// Delete expired snapshots
    Sweep {
        /// Cleanup interval in seconds
        #[arg(long, default_value = "300")]
        cleanup_interval: u64,

        /// Actually delete expired snapshots; without it the sweep only warns
        #[arg(long)]
        remove_expired: bool,

        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

impl Config {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window)
    }

    pub fn webhook(&self) -> WebhookConfig {
        WebhookConfig {
            url: self.refresh_url.clone(),
            header_name: self.refresh_header_name.clone(),
            header_value: self.refresh_header_value.clone(),
            queue_capacity: self.refresh_queue,
            max_concurrent: self.refresh_concurrency,
            timeout: Duration::from_secs(self.refresh_timeout),
        }
    }
}

//! Refresh notification for live snapshots
//!
//! The coordinator hands `(org_id, original_url)` to a [`RefreshNotifier`] and
//! moves on. The webhook implementation queues the request on a bounded channel
//! and a [`RefreshWorker`] delivers it to the external renderer in the background.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Best-effort, non-blocking trigger for an out-of-process snapshot refresh
pub trait RefreshNotifier: Send + Sync {
    fn trigger(&self, org_id: i64, original_url: &str);
}

/// Body posted to the refresh endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub url: String,
    /// Org id, sent as a string
    #[serde(rename = "orgId")]
    pub org_id: String,
}

impl RefreshRequest {
    pub fn new(org_id: i64, original_url: &str) -> Self {
        Self {
            url: original_url.to_string(),
            org_id: org_id.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("refresh endpoint is not configured")]
    NotConfigured,

    #[error("refresh request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("refresh endpoint returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid security header: {0}")]
    InvalidHeader(String),
}

/// Where and how refresh requests are delivered
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Refresh endpoint; `None` disables delivery
    pub url: Option<String>,
    /// Optional shared-secret header sent with each request
    pub header_name: Option<String>,
    pub header_value: Option<String>,
    /// Pending requests held before new ones are dropped
    pub queue_capacity: usize,
    /// Requests in flight at once
    pub max_concurrent: usize,
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            header_name: None,
            header_value: None,
            queue_capacity: 256,
            max_concurrent: 4,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Notifier that queues refresh requests for a [`RefreshWorker`]
#[derive(Clone)]
pub struct WebhookNotifier {
    tx: mpsc::Sender<RefreshRequest>,
}

impl RefreshNotifier for WebhookNotifier {
    fn trigger(&self, org_id: i64, original_url: &str) {
        let request = RefreshRequest::new(org_id, original_url);
        match self.tx.try_send(request) {
            Ok(()) => debug!(
                "Queued snapshot refresh for org {}: {}",
                org_id, original_url
            ),
            Err(mpsc::error::TrySendError::Full(request)) => warn!(
                "Refresh queue full, dropping refresh for org {}: {}",
                request.org_id, request.url
            ),
            Err(mpsc::error::TrySendError::Closed(request)) => error!(
                "Refresh worker stopped, dropping refresh for org {}: {}",
                request.org_id, request.url
            ),
        }
    }
}

/// Background task that posts queued refresh requests
pub struct RefreshWorker {
    client: reqwest::Client,
    config: WebhookConfig,
    limiter: Arc<Semaphore>,
}

impl RefreshWorker {
    /// Start the worker on the current runtime.
    ///
    /// The worker runs until every [`WebhookNotifier`] clone is dropped, then
    /// waits for in-flight deliveries before the handle resolves.
    pub fn spawn(
        client: reqwest::Client,
        config: WebhookConfig,
    ) -> (WebhookNotifier, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = Arc::new(Self {
            client,
            limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
        });

        let handle = tokio::spawn(worker.run(rx));
        (WebhookNotifier { tx }, handle)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<RefreshRequest>) {
        info!(
            "Snapshot refresh worker started (endpoint: {})",
            self.config.url.as_deref().unwrap_or("<none>")
        );

        while let Some(request) = rx.recv().await {
            let Ok(permit) = Arc::clone(&self.limiter).acquire_owned().await else {
                break;
            };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.deliver(&request).await {
                    error!(
                        "Snapshot refresh failed for org {} ({}): {}",
                        request.org_id, request.url, e
                    );
                }
            });
        }

        // Drain: every permit back means every delivery finished.
        let all = u32::try_from(self.config.max_concurrent.max(1)).unwrap_or(u32::MAX);
        let _ = self.limiter.acquire_many(all).await;
        info!("Snapshot refresh worker stopped");
    }

    /// Post one refresh request to the configured endpoint
    pub async fn deliver(&self, request: &RefreshRequest) -> Result<(), NotifyError> {
        let url = self.config.url.as_deref().ok_or(NotifyError::NotConfigured)?;
        debug!(
            "Calling snapshot refresh {} for org {}: {}",
            url, request.org_id, request.url
        );

        let mut builder = self
            .client
            .post(url)
            .timeout(self.config.timeout)
            .json(request);

        if let (Some(name), Some(value)) = (&self.config.header_name, &self.config.header_value) {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| NotifyError::InvalidHeader(e.to_string()))?;
            builder = builder.header(name, value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }

        info!(
            "Snapshot refresh requested for org {}: {}",
            request.org_id, request.url
        );
        Ok(())
    }
}

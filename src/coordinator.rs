//! Live snapshot staleness coordination
//!
//! Decides on each freshness check whether a live snapshot needs re-rendering,
//! claims the refresh so only one caller triggers it, and tells the caller how
//! long to wait before checking again.
//!
//! The snapshot's `updated` column is both the content timestamp and the claim
//! marker. A claim that never turns into a refreshed snapshot is retried once
//! another staleness window has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Result, SnapshotError};
use crate::models::Snapshot;
use crate::notifier::RefreshNotifier;
use crate::storage::{Mutation, SnapshotStore};

/// Window after which a live snapshot is considered stale
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(60);

/// Poll interval returned after claiming a refresh
pub const CLAIMED_POLL_SECS: u64 = 30;

/// Cache interval for snapshots that never refresh
pub const STATIC_CACHE_SECS: u64 = 3600;

/// Interval a caller should advertise when a freshness check fails
pub const ERROR_RETRY_SECS: u64 = 60;

/// Result of a freshness check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Evaluation {
    /// Content is within the staleness window; check again when it leaves it
    Fresh { poll_after_secs: u64 },
    /// This call claimed the refresh and fired the notifier
    Claimed { poll_after_secs: u64 },
}

impl Evaluation {
    pub fn poll_after_secs(&self) -> u64 {
        match self {
            Evaluation::Fresh { poll_after_secs } | Evaluation::Claimed { poll_after_secs } => {
                *poll_after_secs
            }
        }
    }

    pub fn claimed(&self) -> bool {
        matches!(self, Evaluation::Claimed { .. })
    }
}

/// Seconds until `updated` falls out of the window that starts at `since`,
/// rounded up and never below one.
fn seconds_until_stale(updated: DateTime<Utc>, since: DateTime<Utc>) -> u64 {
    let remaining_ms = (updated - since).num_milliseconds().max(0) as u64;
    remaining_ms.div_ceil(1000).max(1)
}

pub struct StalenessCoordinator {
    store: Arc<dyn SnapshotStore>,
    notifier: Arc<dyn RefreshNotifier>,
    clock: Arc<dyn Clock>,
}

impl StalenessCoordinator {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        notifier: Arc<dyn RefreshNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }

    /// Check a live snapshot's freshness and trigger at most one refresh per
    /// staleness episode.
    ///
    /// The stale path re-reads and claims the snapshot in a single store
    /// transaction, so concurrent callers racing on the same key see exactly
    /// one `Claimed`. The notifier runs after commit and its failures are never
    /// returned here.
    pub async fn evaluate_and_maybe_trigger(
        &self,
        key: &str,
        staleness_window: Duration,
    ) -> Result<Evaluation> {
        if !crate::models::is_live_key(key) {
            return Err(SnapshotError::Validation(format!(
                "{key} is not a live snapshot"
            )));
        }

        let now = self.clock.now();
        let since = chrono::Duration::from_std(staleness_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                SnapshotError::Validation(format!(
                    "staleness window of {}s is out of range",
                    staleness_window.as_secs()
                ))
            })?;

        let snapshot = self.store.get(key).await?;
        if snapshot.updated > since {
            return Ok(Evaluation::Fresh {
                poll_after_secs: seconds_until_stale(snapshot.updated, since),
            });
        }

        let mut claimed_url: Option<String> = None;
        let stored = self
            .store
            .update_within_transaction(key, &mut |snapshot: &mut Snapshot| -> Result<Mutation> {
                if snapshot.updated > since {
                    // Another caller claimed it first.
                    return Ok(Mutation::Skip);
                }
                let url = snapshot.original_url()?;
                snapshot.updated = now;
                claimed_url = Some(url);
                Ok(Mutation::Write)
            })
            .await?;

        let Some(url) = claimed_url else {
            debug!("Live snapshot {} already claimed by a concurrent check", key);
            return Ok(Evaluation::Fresh {
                poll_after_secs: seconds_until_stale(stored.updated, since),
            });
        };

        info!(
            "Live snapshot {} is stale, requesting refresh of {} for org {}",
            key, url, stored.org_id
        );
        self.notifier.trigger(stored.org_id, &url);

        Ok(Evaluation::Claimed {
            poll_after_secs: CLAIMED_POLL_SECS,
        })
    }
}

/// Cache interval to advertise for a snapshot.
///
/// Static snapshots never change and get [`STATIC_CACHE_SECS`] without touching
/// the coordinator; live snapshots are evaluated.
pub async fn cache_interval(
    coordinator: &StalenessCoordinator,
    snapshot: &Snapshot,
    staleness_window: Duration,
) -> Result<u64> {
    if !snapshot.is_live() {
        return Ok(STATIC_CACHE_SECS);
    }
    coordinator
        .evaluate_and_maybe_trigger(&snapshot.key, staleness_window)
        .await
        .map(|evaluation| evaluation.poll_after_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::CreateSnapshotCommand;
    use crate::storage::memory::MemoryStore;
    use chrono::Duration as TimeDelta;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(i64, String)>>,
    }

    impl RefreshNotifier for RecordingNotifier {
        fn trigger(&self, org_id: i64, original_url: &str) {
            self.calls.lock().push((org_id, original_url.to_string()));
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        clock: ManualClock,
        coordinator: StalenessCoordinator,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = StalenessCoordinator::new(
            store.clone(),
            notifier.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            store,
            notifier,
            clock,
            coordinator,
        }
    }

    /// Seed a live snapshot last updated `age` ago
    fn seed(fx: &Fixture, key: &str, age: TimeDelta, dashboard: serde_json::Value) -> Snapshot {
        let mut snapshot = CreateSnapshotCommand::new(key, format!("del-{key}"), dashboard)
            .with_owner(27, 14)
            .into_snapshot(fx.clock.now());
        snapshot.updated = fx.clock.now() - age;
        fx.store.insert_raw(snapshot)
    }

    fn payload() -> serde_json::Value {
        json!({ "snapshot": { "originalUrl": "https://x/dash" } })
    }

    #[tokio::test]
    async fn stale_snapshot_is_claimed_and_refreshed() {
        let fx = fixture();
        seed(&fx, "abc-live", TimeDelta::seconds(90), payload());

        let evaluation = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        assert_eq!(evaluation, Evaluation::Claimed { poll_after_secs: 30 });
        assert_eq!(
            *fx.notifier.calls.lock(),
            vec![(27, "https://x/dash".to_string())]
        );
        assert_eq!(fx.store.get("abc-live").await.unwrap().updated, fx.clock.now());
    }

    #[tokio::test]
    async fn fresh_snapshot_reports_remaining_seconds() {
        let fx = fixture();
        let seeded = seed(&fx, "abc-live", TimeDelta::seconds(10), payload());

        let evaluation = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        assert_eq!(evaluation, Evaluation::Fresh { poll_after_secs: 50 });
        assert!(fx.notifier.calls.lock().is_empty());
        assert_eq!(fx.store.get("abc-live").await.unwrap(), seeded);
    }

    #[tokio::test]
    async fn partial_seconds_round_up() {
        let fx = fixture();
        seed(&fx, "abc-live", TimeDelta::milliseconds(59_500), payload());

        let evaluation = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        assert_eq!(evaluation.poll_after_secs(), 1);
        assert!(!evaluation.claimed());
    }

    #[tokio::test]
    async fn exactly_window_old_is_stale() {
        let fx = fixture();
        seed(&fx, "abc-live", TimeDelta::seconds(60), payload());

        let evaluation = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        assert!(evaluation.claimed());
    }

    #[tokio::test]
    async fn second_check_after_claim_is_fresh() {
        let fx = fixture();
        seed(&fx, "abc-live", TimeDelta::seconds(90), payload());

        let first = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();
        let second = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        assert!(first.claimed());
        assert_eq!(second, Evaluation::Fresh { poll_after_secs: 60 });
        assert_eq!(fx.notifier.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn claim_expires_after_another_window() {
        let fx = fixture();
        seed(&fx, "abc-live", TimeDelta::seconds(90), payload());

        fx.coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();
        fx.clock.advance(TimeDelta::seconds(61));
        let again = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        assert!(again.claimed());
        assert_eq!(fx.notifier.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn owner_survives_claim() {
        let fx = fixture();
        seed(&fx, "abc-live", TimeDelta::seconds(90), payload());

        fx.coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        let stored = fx.store.get("abc-live").await.unwrap();
        assert_eq!(stored.user_id, 14);
        assert_eq!(stored.org_id, 27);
    }

    #[tokio::test]
    async fn malformed_payload_fails_without_claiming() {
        let fx = fixture();
        let seeded = seed(&fx, "abc-live", TimeDelta::seconds(90), json!({ "snapshot": {} }));

        for _ in 0..2 {
            let result = fx
                .coordinator
                .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
                .await;
            match result {
                Err(SnapshotError::Validation(msg)) => {
                    assert_eq!(msg, "failed to extract original snapshot URL")
                }
                other => panic!("expected validation error, got {other:?}"),
            }
        }

        assert_eq!(fx.store.get("abc-live").await.unwrap().updated, seeded.updated);
        assert!(fx.notifier.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_found() {
        let fx = fixture();
        let result = fx
            .coordinator
            .evaluate_and_maybe_trigger("gone-live", DEFAULT_STALENESS_WINDOW)
            .await;
        assert!(matches!(result, Err(SnapshotError::NotFound(_))));
    }

    #[tokio::test]
    async fn non_live_key_is_rejected() {
        let fx = fixture();
        let result = fx
            .coordinator
            .evaluate_and_maybe_trigger("abc", DEFAULT_STALENESS_WINDOW)
            .await;
        assert!(matches!(result, Err(SnapshotError::Validation(_))));
    }

    #[tokio::test]
    async fn oversized_window_is_rejected() {
        let fx = fixture();
        let seeded = seed(&fx, "abc-live", TimeDelta::seconds(90), payload());

        for window in [
            Duration::from_secs(1_000_000_000_000_000),
            Duration::from_secs(u64::MAX),
        ] {
            let result = fx.coordinator.evaluate_and_maybe_trigger("abc-live", window).await;
            assert!(matches!(result, Err(SnapshotError::Validation(_))));
        }

        assert_eq!(fx.store.get("abc-live").await.unwrap(), seeded);
        assert!(fx.notifier.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn static_snapshots_skip_the_coordinator() {
        let fx = fixture();
        let snapshot = fx
            .store
            .create(CreateSnapshotCommand::new("abc", "del", json!({})))
            .await
            .unwrap();

        let secs = cache_interval(&fx.coordinator, &snapshot, DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();
        assert_eq!(secs, STATIC_CACHE_SECS);
        assert!(fx.notifier.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn live_snapshots_use_the_poll_interval() {
        let fx = fixture();
        let snapshot = seed(&fx, "abc-live", TimeDelta::seconds(90), payload());

        let secs = cache_interval(&fx.coordinator, &snapshot, DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();
        assert_eq!(secs, CLAIMED_POLL_SECS);
    }

    /// Serves an aged copy from `get` while the row itself has moved on, as a
    /// caller sees it after losing a race for the claim.
    struct OutdatedReads {
        inner: Arc<MemoryStore>,
        lag: TimeDelta,
    }

    #[async_trait::async_trait]
    impl SnapshotStore for OutdatedReads {
        async fn get(&self, key: &str) -> Result<Snapshot> {
            let mut snapshot = self.inner.get(key).await?;
            snapshot.updated -= self.lag;
            Ok(snapshot)
        }

        async fn get_by_delete_key(&self, delete_key: &str) -> Result<Snapshot> {
            self.inner.get_by_delete_key(delete_key).await
        }

        async fn create(&self, cmd: CreateSnapshotCommand) -> Result<Snapshot> {
            self.inner.create(cmd).await
        }

        async fn delete_by_delete_key(&self, delete_key: &str) -> Result<bool> {
            self.inner.delete_by_delete_key(delete_key).await
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            self.inner.delete_expired(now).await
        }

        async fn search(
            &self,
            query: &crate::models::SearchQuery,
        ) -> Result<Vec<crate::models::SnapshotSummary>> {
            self.inner.search(query).await
        }

        async fn update_within_transaction(
            &self,
            key: &str,
            mutate: &mut crate::storage::MutateFn<'_>,
        ) -> Result<Snapshot> {
            self.inner.update_within_transaction(key, mutate).await
        }
    }

    #[tokio::test]
    async fn losing_a_claim_never_moves_updated_backwards() {
        let fx = fixture();
        let seeded = seed(&fx, "abc-live", TimeDelta::seconds(5), payload());
        let coordinator = StalenessCoordinator::new(
            Arc::new(OutdatedReads {
                inner: fx.store.clone(),
                lag: TimeDelta::seconds(120),
            }),
            fx.notifier.clone(),
            Arc::new(fx.clock.clone()),
        );

        let evaluation = coordinator
            .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
            .await
            .unwrap();

        assert_eq!(evaluation, Evaluation::Fresh { poll_after_secs: 55 });
        assert_eq!(fx.store.get("abc-live").await.unwrap().updated, seeded.updated);
        assert!(fx.notifier.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn updated_only_moves_forward_across_checks() {
        let fx = fixture();
        let mut last = seed(&fx, "abc-live", TimeDelta::seconds(90), payload()).updated;

        for step in [0, 10, 45, 20, 70, 1, 61] {
            fx.clock.advance(TimeDelta::seconds(step));
            fx.coordinator
                .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
                .await
                .unwrap();

            let updated = fx.store.get("abc-live").await.unwrap().updated;
            assert!(updated >= last);
            last = updated;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_trigger_once() {
        let fx = Arc::new(fixture());
        seed(&fx, "abc-live", TimeDelta::seconds(90), payload());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fx = Arc::clone(&fx);
                tokio::spawn(async move {
                    fx.coordinator
                        .evaluate_and_maybe_trigger("abc-live", DEFAULT_STALENESS_WINDOW)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().claimed() {
                claimed += 1;
            }
        }

        assert_eq!(claimed, 1);
        assert_eq!(fx.notifier.calls.lock().len(), 1);
        assert_eq!(fx.store.get("abc-live").await.unwrap().updated, fx.clock.now());
    }
}

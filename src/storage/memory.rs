//! In-memory storage backend for testing

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SnapshotError};
use crate::models::{
    CreateSnapshotCommand, SearchQuery, SearchScope, Snapshot, SnapshotSummary, like_match,
};
use crate::storage::{MutateFn, Mutation, SnapshotStore};

/// In-memory snapshot store.
///
/// Rows are keyed by snapshot key. A per-key critical section comes from the
/// map shard lock held across `update_within_transaction`; inserts and deletes
/// additionally take `write_lock` so uniqueness checks and writes are atomic.
pub struct MemoryStore {
    snapshots: DashMap<String, Snapshot>,
    write_lock: Mutex<()>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshots: DashMap::new(),
            write_lock: Mutex::new(()),
            next_id: AtomicI64::new(1),
            clock,
        }
    }

    /// Insert a fully-formed row, bypassing create semantics
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, mut snapshot: Snapshot) -> Snapshot {
        let _guard = self.write_lock.lock();
        snapshot.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.snapshots.insert(snapshot.key.clone(), snapshot.clone());
        snapshot
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn find_by_delete_key(&self, delete_key: &str) -> Option<Snapshot> {
        self.snapshots
            .iter()
            .find(|entry| entry.value().delete_key == delete_key)
            .map(|entry| entry.value().clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Snapshot> {
        self.snapshots
            .get(key)
            .map(|entry| entry.clone())
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))
    }

    async fn get_by_delete_key(&self, delete_key: &str) -> Result<Snapshot> {
        self.find_by_delete_key(delete_key)
            .ok_or_else(|| SnapshotError::NotFound(delete_key.to_string()))
    }

    async fn create(&self, cmd: CreateSnapshotCommand) -> Result<Snapshot> {
        let now = self.clock.now();
        let _guard = self.write_lock.lock();

        if cmd.is_live_upsert()
            && let Some(existing) = self.find_by_delete_key(&cmd.delete_key)
        {
            // Update predicate is key + org; another org's row is never touched.
            if existing.org_id != cmd.org_id {
                return Err(SnapshotError::Conflict(cmd.delete_key));
            }

            let mut snapshot = cmd.into_snapshot(now);
            snapshot.id = existing.id;
            snapshot.key = existing.key;
            snapshot.user_id = existing.user_id;
            snapshot.created = existing.created;

            debug!(
                "Updating live snapshot {} for user {}",
                snapshot.key, snapshot.user_id
            );
            self.snapshots.insert(snapshot.key.clone(), snapshot.clone());
            return Ok(snapshot);
        }

        if self.snapshots.contains_key(&cmd.key) {
            return Err(SnapshotError::Conflict(cmd.key));
        }
        if self.find_by_delete_key(&cmd.delete_key).is_some() {
            return Err(SnapshotError::Conflict(cmd.delete_key));
        }

        let mut snapshot = cmd.into_snapshot(now);
        snapshot.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.snapshots.insert(snapshot.key.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_by_delete_key(&self, delete_key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(snapshot) = self.find_by_delete_key(delete_key) else {
            return Ok(false);
        };
        Ok(self.snapshots.remove(&snapshot.key).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let before = self.snapshots.len();
        self.snapshots.retain(|_, snapshot| !snapshot.is_expired_at(now));
        Ok((before - self.snapshots.len()) as u64)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SnapshotSummary>> {
        let scope = query.requester.scope();
        if scope == SearchScope::Nothing {
            return Ok(vec![]);
        }

        let mut results: Vec<SnapshotSummary> = self
            .snapshots
            .iter()
            .filter(|entry| {
                let snapshot = entry.value();
                if snapshot.org_id != query.org_id {
                    return false;
                }
                if let SearchScope::Owner(user_id) = scope
                    && snapshot.user_id != user_id
                {
                    return false;
                }
                if let Some(ref pattern) = query.name
                    && !like_match(pattern, &snapshot.name)
                {
                    return false;
                }
                true
            })
            .map(|entry| SnapshotSummary::from(entry.value()))
            .collect();

        results.sort_by_key(|summary| summary.id);
        if query.limit > 0 {
            results.truncate(query.limit as usize);
        }

        Ok(results)
    }

    async fn update_within_transaction(
        &self,
        key: &str,
        mutate: &mut MutateFn<'_>,
    ) -> Result<Snapshot> {
        let mut entry = self
            .snapshots
            .get_mut(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))?;

        // Mutate a copy so an error leaves the row untouched.
        let mut working = entry.value().clone();
        match mutate(&mut working)? {
            Mutation::Skip => Ok(entry.value().clone()),
            Mutation::Write => {
                let stored = entry.value_mut();
                stored.name = working.name;
                stored.dashboard = working.dashboard;
                stored.updated = working.updated;
                stored.expires = working.expires;
                Ok(stored.clone())
            }
        }
    }
}

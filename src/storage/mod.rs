//! Snapshot storage backends

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{CreateSnapshotCommand, SearchQuery, Snapshot, SnapshotSummary};

/// Outcome of a transactional mutate function
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Leave the stored row untouched
    Skip,
    /// Persist the mutated snapshot
    Write,
}

/// Callback run against a snapshot inside a store transaction.
///
/// Returning an error aborts the transaction without writing.
pub type MutateFn<'a> = dyn FnMut(&mut Snapshot) -> Result<Mutation> + Send + 'a;

/// Trait for snapshot storage backends
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Get a snapshot by key, `NotFound` if absent
    async fn get(&self, key: &str) -> Result<Snapshot>;

    /// Get a snapshot by delete key, `NotFound` if absent
    async fn get_by_delete_key(&self, delete_key: &str) -> Result<Snapshot>;

    /// Create a snapshot.
    ///
    /// A live delete key that already exists updates that snapshot in place,
    /// keeping its key and creator.
    async fn create(&self, cmd: CreateSnapshotCommand) -> Result<Snapshot>;

    /// Delete by delete key, returning whether a row was removed
    async fn delete_by_delete_key(&self, delete_key: &str) -> Result<bool>;

    /// Delete every snapshot whose expiry is before `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Search snapshots visible to the requester
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SnapshotSummary>>;

    /// Read-modify-write a snapshot as one transaction, serialised per key.
    ///
    /// Returns the snapshot as it stands after the call. Only `name`,
    /// `dashboard`, `updated` and `expires` are written back; the update is
    /// keyed on `key`.
    async fn update_within_transaction(
        &self,
        key: &str,
        mutate: &mut MutateFn<'_>,
    ) -> Result<Snapshot>;
}

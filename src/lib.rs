//! Live dashboard snapshots
//!
//! Storage for dashboard snapshots and the coordinator that keeps `-live`
//! snapshots fresh by triggering an external re-render at most once per
//! staleness window.

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod models;
pub mod notifier;
pub mod storage;

pub use error::{Result, SnapshotError};

pub mod prelude {
    pub use crate::clock::*;
    pub use crate::coordinator::*;
    pub use crate::error::*;
    pub use crate::models::*;
    pub use crate::notifier::*;
    pub use crate::storage::memory::MemoryStore;
    pub use crate::storage::sqlite::SqliteStore;
    pub use crate::storage::{Mutation, SnapshotStore};
}

//! SQLite storage backend

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SnapshotError};
use crate::models::{CreateSnapshotCommand, SearchQuery, SearchScope, Snapshot, SnapshotSummary};
use crate::storage::{MutateFn, Mutation, SnapshotStore};

/// Write transactions take the database write lock up front, so two
/// read-modify-write callers serialise instead of both reading the old row.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create the snapshot table if this database has never held one
    pub async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dashboard_snapshot (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL DEFAULT '',
                key TEXT NOT NULL UNIQUE,
                delete_key TEXT NOT NULL UNIQUE,
                org_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                external INTEGER NOT NULL DEFAULT 0,
                external_url TEXT NOT NULL DEFAULT '',
                external_delete_url TEXT NOT NULL DEFAULT '',
                dashboard TEXT NOT NULL,
                created TEXT NOT NULL,
                updated TEXT NOT NULL,
                expires TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dashboard_snapshot_org_user ON dashboard_snapshot(org_id, user_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dashboard_snapshot_expires ON dashboard_snapshot(expires)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_optional(
        executor: impl sqlx::SqliteExecutor<'_>,
        column: &str,
        value: &str,
    ) -> Result<Option<Snapshot>> {
        let sql = format!("SELECT * FROM dashboard_snapshot WHERE {column} = ?");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(executor)
            .await?;

        row.map(row_to_snapshot).transpose()
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| SnapshotError::Internal(format!("bad timestamp {raw:?}: {e}")))
}

fn row_to_snapshot(row: SqliteRow) -> Result<Snapshot> {
    let dashboard_json: String = row.get("dashboard");
    let created: String = row.get("created");
    let updated: String = row.get("updated");
    let expires: String = row.get("expires");

    Ok(Snapshot {
        id: row.get("id"),
        name: row.get("name"),
        key: row.get("key"),
        delete_key: row.get("delete_key"),
        org_id: row.get("org_id"),
        user_id: row.get("user_id"),
        external: row.get::<i32, _>("external") != 0,
        external_url: row.get("external_url"),
        external_delete_url: row.get("external_delete_url"),
        dashboard: serde_json::from_str(&dashboard_json)?,
        created: parse_timestamp(&created)?,
        updated: parse_timestamp(&updated)?,
        expires: parse_timestamp(&expires)?,
    })
}

/// Map unique-constraint violations to `Conflict`, everything else to `Database`
fn insert_error(err: sqlx::Error, key: &str) -> SnapshotError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SnapshotError::Conflict(key.to_string())
        }
        _ => SnapshotError::Database(err),
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Snapshot> {
        Self::fetch_optional(&self.pool, "key", key)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))
    }

    async fn get_by_delete_key(&self, delete_key: &str) -> Result<Snapshot> {
        Self::fetch_optional(&self.pool, "delete_key", delete_key)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(delete_key.to_string()))
    }

    async fn create(&self, cmd: CreateSnapshotCommand) -> Result<Snapshot> {
        // Stored timestamps carry microseconds.
        let now = self.clock.now().trunc_subsecs(6);
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        let existing = if cmd.is_live_upsert() {
            Self::fetch_optional(&mut *tx, "delete_key", &cmd.delete_key).await?
        } else {
            None
        };

        let snapshot = match existing {
            Some(existing) => {
                let mut snapshot = cmd.into_snapshot(now);
                snapshot.id = existing.id;
                snapshot.key = existing.key;
                snapshot.user_id = existing.user_id;
                snapshot.created = existing.created;

                debug!(
                    "Updating live snapshot {} for user {}",
                    snapshot.key, snapshot.user_id
                );
                let result = sqlx::query(
                    r#"
                    UPDATE dashboard_snapshot SET
                        name = ?,
                        external = ?,
                        external_url = ?,
                        external_delete_url = ?,
                        dashboard = ?,
                        updated = ?,
                        expires = ?
                    WHERE key = ? AND org_id = ?
                    "#,
                )
                .bind(&snapshot.name)
                .bind(snapshot.external as i32)
                .bind(&snapshot.external_url)
                .bind(&snapshot.external_delete_url)
                .bind(serde_json::to_string(&snapshot.dashboard)?)
                .bind(timestamp(snapshot.updated))
                .bind(timestamp(snapshot.expires))
                .bind(&snapshot.key)
                .bind(snapshot.org_id)
                .execute(&mut *tx)
                .await?;

                // Update predicate is key + org; another org's row is never touched.
                if result.rows_affected() == 0 {
                    return Err(SnapshotError::Conflict(snapshot.delete_key));
                }
                snapshot
            }
            None => {
                let mut snapshot = cmd.into_snapshot(now);
                let result = sqlx::query(
                    r#"
                    INSERT INTO dashboard_snapshot (
                        name, key, delete_key, org_id, user_id,
                        external, external_url, external_delete_url,
                        dashboard, created, updated, expires
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&snapshot.name)
                .bind(&snapshot.key)
                .bind(&snapshot.delete_key)
                .bind(snapshot.org_id)
                .bind(snapshot.user_id)
                .bind(snapshot.external as i32)
                .bind(&snapshot.external_url)
                .bind(&snapshot.external_delete_url)
                .bind(serde_json::to_string(&snapshot.dashboard)?)
                .bind(timestamp(snapshot.created))
                .bind(timestamp(snapshot.updated))
                .bind(timestamp(snapshot.expires))
                .execute(&mut *tx)
                .await
                .map_err(|e| insert_error(e, &snapshot.key))?;

                snapshot.id = result.last_insert_rowid();
                snapshot
            }
        };

        tx.commit().await?;
        Ok(snapshot)
    }

    async fn delete_by_delete_key(&self, delete_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dashboard_snapshot WHERE delete_key = ?")
            .bind(delete_key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dashboard_snapshot WHERE expires < ?")
            .bind(timestamp(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SnapshotSummary>> {
        let mut sql =
            QueryBuilder::<Sqlite>::new("SELECT * FROM dashboard_snapshot WHERE org_id = ");
        sql.push_bind(query.org_id);

        match query.requester.scope() {
            SearchScope::Org => {}
            SearchScope::Owner(user_id) => {
                sql.push(" AND user_id = ").push_bind(user_id);
            }
            SearchScope::Nothing => return Ok(vec![]),
        }

        if let Some(name) = &query.name {
            sql.push(" AND name LIKE ").push_bind(name.clone());
        }

        sql.push(" ORDER BY id");
        if query.limit > 0 {
            sql.push(" LIMIT ").push_bind(i64::from(query.limit));
        }

        let rows = sql.build().fetch_all(&self.pool).await?;
        let mut results = vec![];

        for row in rows {
            let snapshot = row_to_snapshot(row)?;
            results.push(SnapshotSummary::from(&snapshot));
        }

        Ok(results)
    }

    async fn update_within_transaction(
        &self,
        key: &str,
        mutate: &mut MutateFn<'_>,
    ) -> Result<Snapshot> {
        // Any early return drops `tx`, which rolls it back.
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        let current = Self::fetch_optional(&mut *tx, "key", key)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))?;

        let mut snapshot = current.clone();
        if mutate(&mut snapshot)? == Mutation::Skip {
            tx.rollback().await?;
            return Ok(current);
        }

        sqlx::query(
            r#"
            UPDATE dashboard_snapshot SET
                name = ?,
                dashboard = ?,
                updated = ?,
                expires = ?
            WHERE key = ?
            "#,
        )
        .bind(&snapshot.name)
        .bind(serde_json::to_string(&snapshot.dashboard)?)
        .bind(timestamp(snapshot.updated))
        .bind(timestamp(snapshot.expires))
        .bind(key)
        .execute(&mut *tx)
        .await?;

        let stored = Self::fetch_optional(&mut *tx, "key", key)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))?;

        tx.commit().await?;
        Ok(stored)
    }
}

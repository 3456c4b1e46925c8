//! Snapshot records, commands and queries

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SnapshotError};

/// Key suffix that marks a periodically refreshed snapshot.
pub const LIVE_SUFFIX: &str = "-live";

/// Lifetime in seconds given to snapshots created without an explicit expiry.
pub const NEVER_EXPIRES_SECS: i64 = 60 * 60 * 24 * 365 * 50;

/// Whether a snapshot key (or delete key) names a live snapshot
pub fn is_live_key(key: &str) -> bool {
    key.ends_with(LIVE_SUFFIX)
}

/// A persisted dashboard snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Store-assigned row id
    pub id: i64,

    pub name: String,

    /// Unique lookup key; ends in `-live` for live snapshots
    pub key: String,

    /// Unique secondary key used for deletion and live upserts
    pub delete_key: String,

    pub org_id: i64,

    /// User who first created the snapshot
    pub user_id: i64,

    pub external: bool,
    pub external_url: String,
    pub external_delete_url: String,

    /// Dashboard content captured at snapshot time
    pub dashboard: Value,

    pub created: DateTime<Utc>,

    /// Last refresh. Also serves as the refresh claim marker for live snapshots.
    pub updated: DateTime<Utc>,

    pub expires: DateTime<Utc>,
}

impl Snapshot {
    pub fn is_live(&self) -> bool {
        is_live_key(&self.key)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }

    /// URL of the dashboard this snapshot was rendered from.
    ///
    /// Read from `dashboard.snapshot.originalUrl`; anything other than a string
    /// there is a validation error.
    pub fn original_url(&self) -> Result<String> {
        self.dashboard
            .get("snapshot")
            .and_then(|snapshot| snapshot.get("originalUrl"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                SnapshotError::Validation("failed to extract original snapshot URL".into())
            })
    }
}

/// Request to create (or, for live snapshots, re-create) a snapshot
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotCommand {
    pub name: String,
    pub key: String,
    pub delete_key: String,
    pub org_id: i64,
    pub user_id: i64,

    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub external_url: String,
    #[serde(default)]
    pub external_delete_url: String,

    pub dashboard: Value,

    /// Lifetime in seconds; zero or negative means never expires
    #[serde(default)]
    pub expires_secs: i64,
}

impl CreateSnapshotCommand {
    pub fn new(key: impl Into<String>, delete_key: impl Into<String>, dashboard: Value) -> Self {
        Self {
            key: key.into(),
            delete_key: delete_key.into(),
            dashboard,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_owner(mut self, org_id: i64, user_id: i64) -> Self {
        self.org_id = org_id;
        self.user_id = user_id;
        self
    }

    pub fn with_expires_secs(mut self, expires_secs: i64) -> Self {
        self.expires_secs = expires_secs;
        self
    }

    pub fn with_external(
        mut self,
        external_url: impl Into<String>,
        external_delete_url: impl Into<String>,
    ) -> Self {
        self.external = true;
        self.external_url = external_url.into();
        self.external_delete_url = external_delete_url.into();
        self
    }

    /// Whether creating with this command may update an existing live snapshot
    pub fn is_live_upsert(&self) -> bool {
        is_live_key(&self.delete_key)
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.expires_secs > 0 {
            now + Duration::seconds(self.expires_secs)
        } else {
            now + Duration::seconds(NEVER_EXPIRES_SECS)
        }
    }

    /// Build the record this command describes, stamped at `now`
    pub fn into_snapshot(self, now: DateTime<Utc>) -> Snapshot {
        let expires = self.expires_at(now);
        Snapshot {
            id: 0,
            name: self.name,
            key: self.key,
            delete_key: self.delete_key,
            org_id: self.org_id,
            user_id: self.user_id,
            external: self.external,
            external_url: self.external_url,
            external_delete_url: self.external_delete_url,
            dashboard: self.dashboard,
            created: now,
            updated: now,
            expires,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrgRole {
    Admin,
    Editor,
    #[default]
    Viewer,
}

/// Who is asking, for search visibility
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub user_id: i64,
    #[serde(default)]
    pub role: OrgRole,
    #[serde(default)]
    pub anonymous: bool,
}

/// Visibility scope resolved from a requester
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    /// Every snapshot in the org
    Org,
    /// Only the requester's own snapshots
    Owner(i64),
    Nothing,
}

impl Requester {
    pub fn scope(&self) -> SearchScope {
        if self.role == OrgRole::Admin {
            SearchScope::Org
        } else if !self.anonymous {
            SearchScope::Owner(self.user_id)
        } else {
            SearchScope::Nothing
        }
    }
}

/// Query parameters for searching snapshots
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub org_id: i64,

    /// Name pattern with SQL `LIKE` semantics (`%` matches any run)
    pub name: Option<String>,

    /// Maximum number of results, 0 for no limit
    #[serde(default)]
    pub limit: u32,

    pub requester: Requester,
}

/// Summary of a snapshot for list responses
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub org_id: i64,
    pub user_id: i64,
    pub external: bool,
    pub external_url: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl From<&Snapshot> for SnapshotSummary {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name.clone(),
            key: snapshot.key.clone(),
            org_id: snapshot.org_id,
            user_id: snapshot.user_id,
            external: snapshot.external,
            external_url: snapshot.external_url.clone(),
            created: snapshot.created,
            updated: snapshot.updated,
            expires: snapshot.expires,
        }
    }
}

/// Match `value` against a SQL `LIKE` pattern (`%` and `_`, case-insensitive ASCII)
pub(crate) fn like_match(pattern: &str, value: &str) -> bool {
    fn go(p: &[u8], v: &[u8]) -> bool {
        match p.split_first() {
            None => v.is_empty(),
            Some((b'%', rest)) => (0..=v.len()).any(|i| go(rest, &v[i..])),
            Some((b'_', rest)) => !v.is_empty() && go(rest, &v[1..]),
            Some((c, rest)) => {
                v.first().is_some_and(|b| b.eq_ignore_ascii_case(c)) && go(rest, &v[1..])
            }
        }
    }
    go(pattern.as_bytes(), value.as_bytes())
}

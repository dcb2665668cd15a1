//! src/services/catalog.rs
//!
//! ObjectCatalog: one SQLite row per published object. Owns the only
//! mutable lifecycle counter (`redemption_count`) and the conditional update
//! that advances it.

use crate::{
    models::object::{ObjectEntry, ObjectId},
    services::lifecycle::{LifecyclePolicy, ObjectState},
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("object `{0}` already exists")]
    Conflict(ObjectId),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Result of a redemption attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// The counter moved from 0 to 1; the caller owns delivery.
    Redeemed(ObjectEntry),
    /// Redeemed earlier. `stale` once the entry is past the retention window;
    /// before that its delivery may still be streaming and owns the purge.
    AlreadyConsumed { stale: bool },
    Expired,
    NotFound,
}

#[derive(FromRow)]
struct ObjectRow {
    id: ObjectId,
    size_bytes: i64,
    content_type: String,
    original_name: String,
    created_at: i64,
    redemption_count: i64,
}

impl From<ObjectRow> for ObjectEntry {
    fn from(row: ObjectRow) -> Self {
        Self {
            id: row.id,
            size_bytes: row.size_bytes,
            content_type: row.content_type,
            original_name: row.original_name,
            created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
            redemption_count: row.redemption_count,
        }
    }
}

/// Drop sub-millisecond precision so stored and in-memory timestamps agree.
pub fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

#[derive(Clone)]
pub struct ObjectCatalog {
    db: Arc<SqlitePool>,
    policy: LifecyclePolicy,
}

impl ObjectCatalog {
    pub fn new(db: Arc<SqlitePool>, policy: LifecyclePolicy) -> Self {
        Self { db, policy }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Publish a new entry. Fails with `Conflict` if the id is taken.
    pub async fn insert(&self, entry: &ObjectEntry) -> CatalogResult<()> {
        let result = sqlx::query(
            "INSERT INTO objects (id, size_bytes, content_type, original_name, created_at, redemption_count)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id)
        .bind(entry.size_bytes)
        .bind(&entry.content_type)
        .bind(&entry.original_name)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.redemption_count)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(CatalogError::Conflict(entry.id)),
            Err(err) => Err(CatalogError::Sqlx(err)),
        }
    }

    pub async fn get(&self, id: &ObjectId) -> CatalogResult<Option<ObjectEntry>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT id, size_bytes, content_type, original_name, created_at, redemption_count
             FROM objects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row.map(ObjectEntry::from))
    }

    /// Check-and-increment in a single conditional UPDATE.
    ///
    /// Only a row with `redemption_count = 0` created at or after `now - T`
    /// matches, so of any number of concurrent callers at most one gets
    /// `Redeemed`. When nothing matched, the row is re-read only to report why.
    pub async fn try_redeem(&self, id: &ObjectId, now: DateTime<Utc>) -> CatalogResult<RedeemOutcome> {
        let now = truncate_to_millis(now);
        let cutoff = self.policy.cutoff(now);

        let redeemed = sqlx::query_as::<_, ObjectRow>(
            "UPDATE objects SET redemption_count = redemption_count + 1
             WHERE id = ? AND redemption_count = 0 AND created_at >= ?
             RETURNING id, size_bytes, content_type, original_name, created_at, redemption_count",
        )
        .bind(id)
        .bind(cutoff.timestamp_millis())
        .fetch_optional(&*self.db)
        .await?;

        if let Some(row) = redeemed {
            return Ok(RedeemOutcome::Redeemed(row.into()));
        }

        let current = self.get(id).await?;
        Ok(match self.policy.state(current.as_ref(), now) {
            ObjectState::Deleted => RedeemOutcome::NotFound,
            ObjectState::Consumed => RedeemOutcome::AlreadyConsumed {
                stale: current.as_ref().is_some_and(|entry| entry.created_at < cutoff),
            },
            ObjectState::Expired => RedeemOutcome::Expired,
            ObjectState::Alive => {
                // Only reachable if the row changed between the two statements.
                warn!(%id, "redemption raced with a concurrent change, treating as consumed");
                RedeemOutcome::AlreadyConsumed { stale: false }
            }
        })
    }

    /// Remove an entry. Returns `false` if it was already absent.
    pub async fn delete(&self, id: &ObjectId) -> CatalogResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Ids of entries created strictly before `cutoff`, oldest first.
    pub async fn list_older_than(&self, cutoff: DateTime<Utc>) -> CatalogResult<Vec<ObjectId>> {
        let ids = sqlx::query_scalar::<_, ObjectId>(
            "SELECT id FROM objects WHERE created_at < ? ORDER BY created_at ASC",
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }

    pub async fn ping(&self) -> CatalogResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

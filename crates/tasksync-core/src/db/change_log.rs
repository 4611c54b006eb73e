//! Append-only change log repository

use chrono::{DateTime, Utc};
use libsql::{params, Connection};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{NewLogEntry, SyncLogEntry};
use crate::util::datetime_from_micros;

/// Trait for change-log storage operations (async)
///
/// There is deliberately no update or delete: rows are immutable once written.
#[allow(async_fn_in_trait)]
pub trait ChangeLogRepository {
    /// Append an entry, assigning its id and `synced_at`
    async fn append(&self, entry: NewLogEntry) -> Result<SyncLogEntry>;

    /// Entries for `user_id` written by any device other than `exclude_device_id`,
    /// with `synced_at >= since` when given, oldest first, at most `limit` rows
    async fn query_for_device(
        &self,
        user_id: &str,
        exclude_device_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>>;

    /// Number of entries recorded for a user
    async fn count_for_user(&self, user_id: &str) -> Result<u64>;
}

/// libSQL implementation of `ChangeLogRepository`
pub struct LibSqlChangeLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlChangeLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &libsql::Row) -> Result<SyncLogEntry> {
        let id: String = row.get(0)?;
        let operation: String = row.get(3)?;
        let entity_type: String = row.get(4)?;
        let entity_id: String = row.get(5)?;
        let changes: String = row.get(6)?;
        let vector_clock: String = row.get(7)?;

        Ok(SyncLogEntry {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("Invalid log entry id: {id}")))?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            operation: operation.parse().map_err(Error::Database)?,
            entity_type: entity_type.parse().map_err(Error::Database)?,
            entity_id: Uuid::parse_str(&entity_id)
                .map_err(|_| Error::Database(format!("Invalid entity id: {entity_id}")))?,
            changes: serde_json::from_str(&changes)?,
            vector_clock: serde_json::from_str(&vector_clock)?,
            synced_at: datetime_from_micros(row.get(8)?),
        })
    }
}

impl ChangeLogRepository for LibSqlChangeLogRepository<'_> {
    async fn append(&self, entry: NewLogEntry) -> Result<SyncLogEntry> {
        if entry.vector_clock.is_empty() {
            return Err(Error::InvalidInput(
                "Log entries require a non-empty vector clock".into(),
            ));
        }

        let id = crate::models::LogEntryId::new();
        let now = Utc::now().timestamp_micros();
        let changes = serde_json::to_string(&entry.changes)?;
        let vector_clock = serde_json::to_string(&entry.vector_clock)?;

        // Receipt time never goes backwards, even if the wall clock does.
        let mut rows = self
            .conn
            .query(
                "INSERT INTO sync_log (
                    id, user_id, device_id, operation, entity_type, entity_id,
                    changes, vector_clock, synced_at
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                    MAX(?9, COALESCE((SELECT MAX(synced_at) FROM sync_log), 0) + 1)
                 )
                 RETURNING synced_at",
                params![
                    id.as_str(),
                    entry.user_id.as_str(),
                    entry.device_id.as_str(),
                    entry.operation.as_str(),
                    entry.entity_type.as_str(),
                    entry.entity_id.to_string(),
                    changes,
                    vector_clock,
                    now
                ],
            )
            .await?;

        let synced_at: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => return Err(Error::Database("Log append returned no row".into())),
        };

        Ok(SyncLogEntry {
            id,
            user_id: entry.user_id,
            device_id: entry.device_id,
            operation: entry.operation,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            changes: entry.changes,
            vector_clock: entry.vector_clock,
            synced_at: datetime_from_micros(synced_at),
        })
    }

    async fn query_for_device(
        &self,
        user_id: &str,
        exclude_device_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>> {
        let since = since.map_or(i64::MIN, |since| since.timestamp_micros());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut rows = self
            .conn
            .query(
                "SELECT id, user_id, device_id, operation, entity_type, entity_id,
                        changes, vector_clock, synced_at
                 FROM sync_log
                 WHERE user_id = ?1 AND device_id != ?2 AND synced_at >= ?3
                 ORDER BY synced_at ASC
                 LIMIT ?4",
                params![user_id, exclude_device_id, since, limit],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }

    async fn count_for_user(&self, user_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_log WHERE user_id = ?1",
                params![user_id],
            )
            .await?;

        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

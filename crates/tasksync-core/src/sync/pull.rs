//! Pull coordinator: page through the change log and collapse it per entity

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use libsql::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{ChangeLogRepository, LibSqlChangeLogRepository};
use crate::error::Result;
use crate::models::{EntityType, ResolvedChange, SyncLogEntry};
use crate::util::{parse_timestamp, user_fingerprint};
use crate::validation::{validate_device_id, ValidationError};

/// Number of log entries fetched per pull
pub const PULL_PAGE_SIZE: usize = 100;

/// A validated pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Device asking; its own entries are never returned
    pub device_id: String,
    /// Inclusive lower bound on `synced_at`
    pub since: Option<DateTime<Utc>>,
}

impl PullRequest {
    /// Build a request from raw query parameters
    pub fn parse(
        device_id: Option<&str>,
        since: Option<&str>,
    ) -> std::result::Result<Self, ValidationError> {
        let device_id = validate_device_id(device_id)?;
        let since = match since.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => Some(parse_since(value)?),
            None => None,
        };
        Ok(Self { device_id, since })
    }
}

/// Parse a pull cursor: RFC 3339, or integer Unix milliseconds (`0` means from the start)
pub fn parse_since(value: &str) -> std::result::Result<DateTime<Utc>, ValidationError> {
    if let Ok(millis) = value.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| ValidationError::new("since", "timestamp out of range"));
    }
    parse_timestamp(value)
        .ok_or_else(|| ValidationError::new("since", "must be an ISO-8601 timestamp"))
}

/// Pull response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<ResolvedChange>,
    /// Cursor to pass back as `since` for the next page
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    pub limit: usize,
}

/// Collapse log entries to one change per entity.
///
/// The entry with the greatest `synced_at` wins. The winner is flagged as a
/// conflict when its vector clock is concurrent with any other entry for the
/// same entity. Output is ordered by the winners' `synced_at`.
pub fn resolve(entries: Vec<SyncLogEntry>) -> Vec<ResolvedChange> {
    let mut groups: HashMap<(EntityType, Uuid), Vec<SyncLogEntry>> = HashMap::new();
    for entry in entries {
        groups
            .entry((entry.entity_type, entry.entity_id))
            .or_default()
            .push(entry);
    }

    let mut resolved: Vec<ResolvedChange> = groups
        .into_values()
        .filter_map(|mut group| {
            group.sort_by_key(|entry| entry.synced_at);
            let winner = group.pop()?;
            let conflict = group
                .iter()
                .any(|other| winner.vector_clock.is_concurrent(&other.vector_clock));
            Some(ResolvedChange {
                conflict,
                ..ResolvedChange::from(winner)
            })
        })
        .collect();

    resolved.sort_by_key(|change| change.synced_at);
    resolved
}

/// Fetch one page of other devices' changes for a user
pub async fn pull_changes(
    conn: &Connection,
    user_id: &str,
    request: &PullRequest,
) -> Result<PullResponse> {
    let entries = LibSqlChangeLogRepository::new(conn)
        .query_for_device(user_id, &request.device_id, request.since, PULL_PAGE_SIZE)
        .await?;

    let fetched = entries.len();
    let has_more = fetched == PULL_PAGE_SIZE;
    let timestamp = entries.last().map_or_else(
        || request.since.unwrap_or_default(),
        |entry| entry.synced_at + Duration::microseconds(1),
    );

    let changes = resolve(entries);
    let conflicts = changes.iter().filter(|change| change.conflict).count();
    tracing::info!(
        user = user_fingerprint(user_id),
        device = %request.device_id,
        fetched,
        resolved = changes.len(),
        conflicts,
        has_more,
        "Served pull page"
    );

    Ok(PullResponse {
        changes,
        timestamp,
        has_more,
        limit: PULL_PAGE_SIZE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{LogEntryId, NewLogEntry, Operation, VectorClock};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};

    const USER: &str = "7b0c7f3e-3c55-4b7e-9a55-1f0f3f1d2a10";

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs
            .iter()
            .map(|(device, counter)| ((*device).to_string(), *counter))
            .collect()
    }

    fn log_entry(entity_id: Uuid, micros: i64, vector_clock: VectorClock) -> SyncLogEntry {
        SyncLogEntry {
            id: LogEntryId::new(),
            user_id: USER.to_string(),
            device_id: "B".to_string(),
            operation: Operation::Update,
            entity_type: EntityType::Task,
            entity_id,
            changes: Map::new(),
            vector_clock,
            synced_at: crate::util::datetime_from_micros(micros),
        }
    }

    async fn append(conn: &Connection, device: &str, entity_id: Uuid, data: Value) {
        let mut vector_clock = VectorClock::new();
        vector_clock.increment(device);
        LibSqlChangeLogRepository::new(conn)
            .append(NewLogEntry {
                user_id: USER.to_string(),
                device_id: device.to_string(),
                operation: Operation::Update,
                entity_type: EntityType::Task,
                entity_id,
                changes: data.as_object().cloned().unwrap_or_default(),
                vector_clock,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_since() {
        assert_eq!(parse_since("0").unwrap(), DateTime::<Utc>::default());
        assert_eq!(
            parse_since("2024-05-01T10:00:00.000123Z").unwrap().timestamp_subsec_micros(),
            123
        );
        assert_eq!(parse_since("yesterday").unwrap_err().field, "since");
    }

    #[test]
    fn test_pull_request_requires_device_id() {
        assert_eq!(
            PullRequest::parse(None, None).unwrap_err().field,
            "device_id"
        );
        let request = PullRequest::parse(Some(" A "), Some("")).unwrap();
        assert_eq!(request.device_id, "A");
        assert_eq!(request.since, None);
    }

    #[test]
    fn test_resolve_latest_synced_at_wins() {
        let task = Uuid::now_v7();
        let mut first = log_entry(task, 10, clock(&[("A", 1)]));
        first.changes.insert("title".into(), json!("a"));
        let mut second = log_entry(task, 20, clock(&[("B", 1)]));
        second.changes.insert("title".into(), json!("b"));

        let resolved = resolve(vec![second, first]);

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].data["title"], "b");
        assert!(resolved[0].conflict);
    }

    #[test]
    fn test_resolve_causal_history_is_not_a_conflict() {
        let task = Uuid::now_v7();
        let resolved = resolve(vec![
            log_entry(task, 10, clock(&[("A", 1)])),
            log_entry(task, 20, clock(&[("A", 1), ("B", 1)])),
        ]);
        assert_eq!(resolved.len(), 1);
        assert!(!resolved[0].conflict);
    }

    #[test]
    fn test_resolve_orders_by_synced_at() {
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        let resolved = resolve(vec![
            log_entry(a, 50, clock(&[("A", 1)])),
            log_entry(b, 10, clock(&[("A", 2)])),
            log_entry(c, 30, clock(&[("A", 3)])),
            log_entry(b, 40, clock(&[("A", 4)])),
        ]);
        let ids: Vec<Uuid> = resolved.iter().map(|change| change.entity_id).collect();
        assert_eq!(ids, vec![c, b, a]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_excludes_own_device() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        append(conn, "A", Uuid::now_v7(), json!({ "title": "mine" })).await;

        let request = PullRequest::parse(Some("A"), Some("0")).unwrap();
        let response = pull_changes(conn, USER, &request).await.unwrap();

        assert!(response.changes.is_empty());
        assert!(!response.has_more);
        assert_eq!(response.limit, PULL_PAGE_SIZE);
        assert_eq!(response.timestamp, DateTime::<Utc>::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pagination_returns_each_entry_once() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let total = PULL_PAGE_SIZE + 37;
        let ids: Vec<Uuid> = (0..total).map(|_| Uuid::now_v7()).collect();
        for id in &ids {
            append(conn, "B", *id, json!({ "title": "x" })).await;
        }

        let mut seen = Vec::new();
        let mut since = None;
        let mut pages = 0;
        loop {
            let request = PullRequest {
                device_id: "A".to_string(),
                since,
            };
            let response = pull_changes(conn, USER, &request).await.unwrap();
            pages += 1;
            seen.extend(response.changes.iter().map(|change| change.entity_id));
            since = Some(response.timestamp);
            if !response.has_more {
                break;
            }
        }

        assert_eq!(pages, 2);
        assert_eq!(seen, ids);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_page_keeps_cursor() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let since = parse_since("2030-01-01T00:00:00Z").unwrap();

        let response = pull_changes(
            conn,
            USER,
            &PullRequest {
                device_id: "A".to_string(),
                since: Some(since),
            },
        )
        .await
        .unwrap();
        assert_eq!(response.timestamp, since);
    }

    #[test]
    fn test_response_uses_has_more_key() {
        let response = PullResponse {
            changes: Vec::new(),
            timestamp: DateTime::<Utc>::default(),
            has_more: false,
            limit: PULL_PAGE_SIZE,
        };
        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["hasMore"], json!(false));
        assert_eq!(value["limit"], json!(100));
        assert!(value.get("has_more").is_none());
    }
}

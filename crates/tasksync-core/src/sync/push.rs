//! Push coordinator: apply a validated batch to canonical storage and the change log
//!
//! Two appliers share one precondition (a [`ValidatedBatch`]) and one result
//! shape (`Vec<ItemResult>`). The transactional applier runs the whole batch
//! in a single storage transaction; if anything in it fails the transaction is
//! rolled back and the sequential applier takes over, applying items one by
//! one with independent success or failure.

use libsql::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    claim_task, ensure_self, ChangeLogRepository, LibSqlChangeLogRepository, LibSqlTaskRepository,
    LibSqlUserRepository, TaskRepository, UserRepository,
};
use crate::error::{Error, Result};
use crate::models::{EntityType, NewLogEntry, Operation};
use crate::util::{compact_text, user_fingerprint};
use crate::validation::{BatchItem, ValidatedBatch, ValidatedChange};

/// Outcome of a single batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Error,
}

/// Per-item entry of the push response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub entity_id: Uuid,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub const fn success(entity_id: Uuid) -> Self {
        Self {
            entity_id,
            status: ItemStatus::Success,
            error: None,
        }
    }

    pub fn failure(entity_id: Uuid, error: &str) -> Self {
        Self {
            entity_id,
            status: ItemStatus::Error,
            error: Some(compact_text(error)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

/// Push response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub results: Vec<ItemResult>,
    /// Whether the atomic path produced these results
    pub transactional: bool,
}

/// Failure of an applier as a whole
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The atomic batch could not be committed; nothing from it persisted
    #[error("Transactional apply failed: {0}")]
    Transaction(#[source] Error),
}

/// A strategy for applying a validated batch on behalf of a user
#[allow(async_fn_in_trait)]
pub trait BatchApplier {
    /// Whether results from this applier are all-or-nothing
    fn is_transactional(&self) -> bool;

    /// Apply every accepted item, returning one result per batch slot in order
    async fn apply(
        &self,
        user_id: &str,
        batch: &ValidatedBatch,
    ) -> std::result::Result<Vec<ItemResult>, ApplyError>;
}

/// All-or-nothing applier backed by a storage transaction
pub struct TransactionalApplier<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionalApplier<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl BatchApplier for TransactionalApplier<'_> {
    fn is_transactional(&self) -> bool {
        true
    }

    async fn apply(
        &self,
        user_id: &str,
        batch: &ValidatedBatch,
    ) -> std::result::Result<Vec<ItemResult>, ApplyError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|error| ApplyError::Transaction(error.into()))?;

        let applied = async {
            for change in batch.accepted() {
                apply_change(&tx, user_id, &batch.device_id, change).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(error) = applied {
            tx.rollback().await.ok();
            return Err(ApplyError::Transaction(error));
        }
        tx.commit()
            .await
            .map_err(|error| ApplyError::Transaction(error.into()))?;

        Ok(batch
            .items
            .iter()
            .map(|item| match item {
                BatchItem::Accepted(change) => ItemResult::success(change.entity_id),
                BatchItem::Rejected { entity_id, error } => ItemResult::failure(*entity_id, error),
            })
            .collect())
    }
}

/// Non-atomic applier: each item succeeds or fails on its own
pub struct SequentialApplier<'a> {
    conn: &'a Connection,
}

impl<'a> SequentialApplier<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl BatchApplier for SequentialApplier<'_> {
    fn is_transactional(&self) -> bool {
        false
    }

    async fn apply(
        &self,
        user_id: &str,
        batch: &ValidatedBatch,
    ) -> std::result::Result<Vec<ItemResult>, ApplyError> {
        let mut results = Vec::with_capacity(batch.len());
        for item in &batch.items {
            let result = match item {
                BatchItem::Accepted(change) => {
                    match apply_change(self.conn, user_id, &batch.device_id, change).await {
                        Ok(()) => ItemResult::success(change.entity_id),
                        Err(error) => {
                            tracing::debug!(
                                entity_id = %change.entity_id,
                                error = %error,
                                "Sequential apply failed for item"
                            );
                            ItemResult::failure(change.entity_id, &error.to_string())
                        }
                    }
                }
                BatchItem::Rejected { entity_id, error } => ItemResult::failure(*entity_id, error),
            };
            results.push(result);
        }
        Ok(results)
    }
}

/// Authorize, log, then mutate canonical state for one change
async fn apply_change(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    change: &ValidatedChange,
) -> Result<()> {
    match change.entity_type {
        EntityType::User => ensure_self(user_id, change.entity_id)?,
        EntityType::Task => {
            claim_task(&LibSqlTaskRepository::new(conn), user_id, change.entity_id).await?;
        }
    }

    LibSqlChangeLogRepository::new(conn)
        .append(NewLogEntry {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            operation: change.operation,
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            changes: change.data.clone(),
            vector_clock: change.vector_clock.clone(),
        })
        .await?;

    match (change.entity_type, change.operation) {
        (EntityType::Task, Operation::Create) => {
            let inserted = LibSqlTaskRepository::new(conn)
                .insert(user_id, change.entity_id, &change.data)
                .await?;
            if !inserted {
                tracing::debug!(entity_id = %change.entity_id, "Replayed create ignored");
            }
        }
        (EntityType::Task, Operation::Update) => {
            let rows = LibSqlTaskRepository::new(conn)
                .update_fields(user_id, change.entity_id, &change.data)
                .await?;
            if rows == 0 {
                tracing::debug!(entity_id = %change.entity_id, "Update matched no task row");
            }
        }
        (EntityType::Task, Operation::Delete) => {
            LibSqlTaskRepository::new(conn)
                .soft_delete(user_id, change.entity_id)
                .await?;
        }
        (EntityType::User, Operation::Update) => {
            LibSqlUserRepository::new(conn)
                .update_profile(user_id, change.entity_id, &change.data)
                .await?;
        }
        (EntityType::User, operation) => {
            return Err(Error::UnsupportedOperation(format!(
                "`{operation}` on entity_type `user`"
            )));
        }
    }

    Ok(())
}

/// Apply a batch atomically if possible, falling back to per-item application
pub async fn push_batch(conn: &Connection, user_id: &str, batch: &ValidatedBatch) -> PushOutcome {
    let transactional = TransactionalApplier::new(conn);
    let sequential = SequentialApplier::new(conn);

    let outcome = match transactional.apply(user_id, batch).await {
        Ok(results) => PushOutcome {
            results,
            transactional: transactional.is_transactional(),
        },
        Err(error) => {
            tracing::warn!(
                user = user_fingerprint(user_id),
                device = %batch.device_id,
                error = %error,
                "Transactional push failed; falling back to sequential apply"
            );
            let results = match sequential.apply(user_id, batch).await {
                Ok(results) => results,
                Err(error) => batch
                    .items
                    .iter()
                    .map(|item| ItemResult::failure(item.entity_id(), &error.to_string()))
                    .collect(),
            };
            PushOutcome {
                results,
                transactional: sequential.is_transactional(),
            }
        }
    };

    let errors = outcome
        .results
        .iter()
        .filter(|result| !result.is_success())
        .count();
    tracing::info!(
        user = user_fingerprint(user_id),
        device = %batch.device_id,
        items = batch.len(),
        transactional = outcome.transactional,
        errors,
        "Applied push batch"
    );

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Task;
    use crate::validation::parse_push_request;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    const USER: &str = "7b0c7f3e-3c55-4b7e-9a55-1f0f3f1d2a10";
    const OTHER_USER: &str = "0f6b2d8e-5a4c-4f1e-8d2b-9c3a7e6f5b41";

    fn batch(device_id: &str, changes: Value) -> ValidatedBatch {
        parse_push_request(&json!({ "device_id": device_id, "changes": changes })).unwrap()
    }

    fn task_change(operation: &str, entity_id: Uuid, data: Value) -> Value {
        json!({
            "operation": operation,
            "entity_type": "task",
            "entity_id": entity_id.to_string(),
            "data": data,
            "vector_clock": { "A": 1 }
        })
    }

    async fn log_count(conn: &Connection) -> u64 {
        LibSqlChangeLogRepository::new(conn)
            .count_for_user(USER)
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_creates_task_transactionally() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();

        let outcome = push_batch(
            conn,
            USER,
            &batch(
                "A",
                json!([task_change(
                    "create",
                    id,
                    json!({ "title": "Buy milk", "task_type": "todo", "hacker": 1 })
                )]),
            ),
        )
        .await;

        assert!(outcome.transactional);
        assert_eq!(outcome.results, vec![ItemResult::success(id)]);

        let task = LibSqlTaskRepository::new(conn).get(USER, id).await.unwrap().unwrap();
        assert_eq!(task.title, "Buy milk");
        assert_eq!(log_count(conn).await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_results_match_batch_length_and_order() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let ids: Vec<Uuid> = (0..25).map(|_| Uuid::now_v7()).collect();
        let changes: Vec<Value> = ids
            .iter()
            .map(|id| task_change("create", *id, json!({ "title": "t" })))
            .collect();

        let outcome = push_batch(conn, USER, &batch("A", Value::Array(changes))).await;

        assert_eq!(outcome.results.len(), ids.len());
        let returned: Vec<Uuid> = outcome.results.iter().map(|r| r.entity_id).collect();
        assert_eq!(returned, ids);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replayed_update_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let id = Uuid::now_v7();
        let repo = LibSqlTaskRepository::new(conn);

        let create = batch("A", json!([task_change("create", id, json!({ "title": "x" }))]));
        push_batch(conn, USER, &create).await;
        let update = batch(
            "A",
            json!([task_change("update", id, json!({ "title": "y", "priority": 2 }))]),
        );

        let first = push_batch(conn, USER, &update).await;
        let after_first = repo.get(USER, id).await.unwrap().unwrap();
        let second = push_batch(conn, USER, &update).await;
        let after_second = repo.get(USER, id).await.unwrap().unwrap();

        assert!(first.results[0].is_success());
        assert!(second.results[0].is_success());
        assert_eq!(
            Task { updated_at: after_first.updated_at, ..after_second },
            after_first
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_of_missing_row_is_success() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let id = Uuid::now_v7();

        let outcome = push_batch(
            conn,
            USER,
            &batch("A", json!([task_change("update", id, json!({ "title": "ghost" }))])),
        )
        .await;
        assert!(outcome.transactional);
        assert!(outcome.results[0].is_success());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_soft_deletes() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let id = Uuid::now_v7();

        push_batch(conn, USER, &batch("A", json!([task_change("create", id, json!({}))]))).await;
        let outcome = push_batch(
            conn,
            USER,
            &batch("A", json!([{
                "operation": "delete",
                "entity_type": "task",
                "entity_id": id.to_string(),
                "vector_clock": { "A": 2 }
            }])),
        )
        .await;

        assert!(outcome.results[0].is_success());
        let task = LibSqlTaskRepository::new(conn).get(USER, id).await.unwrap().unwrap();
        assert!(task.is_deleted());
        assert_eq!(log_count(conn).await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_entity_type_is_item_error_only() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let good = Uuid::now_v7();
        let bad = Uuid::now_v7();

        let outcome = push_batch(
            conn,
            USER,
            &batch(
                "A",
                json!([
                    {
                        "operation": "update",
                        "entity_type": "project",
                        "entity_id": bad.to_string(),
                        "data": {},
                        "vector_clock": { "A": 1 }
                    },
                    task_change("create", good, json!({ "title": "fine" }))
                ]),
            ),
        )
        .await;

        assert!(outcome.transactional);
        assert_eq!(outcome.results[0].status, ItemStatus::Error);
        assert!(outcome.results[0].error.as_deref().unwrap().contains("project"));
        assert!(outcome.results[1].is_success());
        assert_eq!(log_count(conn).await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_foreign_user_update_falls_back_to_sequential() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let task = Uuid::now_v7();
        let me = Uuid::parse_str(USER).unwrap();
        let someone_else = Uuid::parse_str(OTHER_USER).unwrap();

        let user_change = |target: Uuid, name: &str| {
            json!({
                "operation": "update",
                "entity_type": "user",
                "entity_id": target.to_string(),
                "data": { "display_name": name },
                "vector_clock": { "A": 1 }
            })
        };

        let outcome = push_batch(
            conn,
            USER,
            &batch(
                "A",
                json!([
                    task_change("create", task, json!({ "title": "kept" })),
                    user_change(someone_else, "Mallory"),
                    user_change(me, "Ada")
                ]),
            ),
        )
        .await;

        assert!(!outcome.transactional);
        assert!(outcome.results[0].is_success());
        assert_eq!(outcome.results[1].status, ItemStatus::Error);
        assert!(outcome.results[1].error.as_deref().unwrap().contains("Forbidden"));
        assert!(outcome.results[2].is_success());

        // The rolled-back transactional attempt leaves no trace; the rejected item is never logged.
        assert_eq!(log_count(conn).await, 2);
        let profile = LibSqlUserRepository::new(conn).get(USER).await.unwrap().unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Ada"));
        assert!(LibSqlUserRepository::new(conn).get(OTHER_USER).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_with_foreign_task_id_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let id = Uuid::now_v7();

        push_batch(
            conn,
            USER,
            &batch("A", json!([task_change("create", id, json!({ "title": "original" }))])),
        )
        .await;

        let outcome = push_batch(
            conn,
            OTHER_USER,
            &batch(
                "X",
                json!([
                    task_change("create", id, json!({ "title": "hijack" })),
                    task_change("update", id, json!({ "title": "hijack" }))
                ]),
            ),
        )
        .await;

        assert!(!outcome.transactional);
        for result in &outcome.results {
            assert_eq!(result.status, ItemStatus::Error);
            assert!(result.error.as_deref().unwrap().contains("Forbidden"));
        }

        let repo = LibSqlTaskRepository::new(conn);
        assert_eq!(repo.get(USER, id).await.unwrap().unwrap().title, "original");
        assert!(repo.get(OTHER_USER, id).await.unwrap().is_none());
        let other_log = LibSqlChangeLogRepository::new(conn)
            .count_for_user(OTHER_USER)
            .await
            .unwrap();
        assert_eq!(other_log, 0);
        assert_eq!(log_count(conn).await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_batch() {
        let db = Database::open_in_memory().await.unwrap();
        let outcome = push_batch(db.connection(), USER, &batch("A", json!([]))).await;
        assert!(outcome.transactional);
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn test_item_result_serialization() {
        let id = Uuid::nil();
        assert_eq!(
            serde_json::to_value(ItemResult::success(id)).unwrap(),
            json!({ "entity_id": id.to_string(), "status": "success" })
        );
        assert_eq!(
            serde_json::to_value(ItemResult::failure(id, "boom")).unwrap(),
            json!({ "entity_id": id.to_string(), "status": "error", "error": "boom" })
        );
    }
}

//! Sync engine: push and pull coordinators over a shared database

mod pull;
mod push;

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{
    ChangeLogRepository, Database, LibSqlChangeLogRepository, LibSqlTaskRepository,
    LibSqlUserRepository, TaskRepository, UserRepository,
};
use crate::models::{Task, UserProfile};
use crate::validation::{parse_push_request, ValidatedBatch};
use crate::Result;

pub use pull::{parse_since, pull_changes, resolve, PullRequest, PullResponse, PULL_PAGE_SIZE};
pub use push::{
    push_batch, ApplyError, BatchApplier, ItemResult, ItemStatus, PushOutcome, SequentialApplier,
    TransactionalApplier,
};

/// Thread-safe handle to the sync store, cheap to clone into request handlers.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
}

impl SyncStore {
    /// Open (and migrate) the store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|error| crate::Error::Database(error.to_string()))?;
        }
        Ok(Self::from_database(Database::open(path).await?))
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory().await?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Validate a raw push payload and apply it for `user_id`.
    ///
    /// Schema failures return [`crate::Error::Validation`] before anything is
    /// written; everything after that is reported per item.
    pub async fn push(&self, user_id: &str, payload: &Value) -> Result<PushOutcome> {
        let batch = parse_push_request(payload)?;
        Ok(self.push_validated(user_id, &batch).await)
    }

    /// Apply an already validated batch.
    pub async fn push_validated(&self, user_id: &str, batch: &ValidatedBatch) -> PushOutcome {
        let db = self.db.lock().await;
        push_batch(db.connection(), user_id, batch).await
    }

    /// Fetch the next page of changes made by the user's other devices.
    pub async fn pull(&self, user_id: &str, request: &PullRequest) -> Result<PullResponse> {
        let db = self.db.lock().await;
        pull_changes(db.connection(), user_id, request).await
    }

    pub async fn get_task(&self, user_id: &str, id: Uuid) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        LibSqlTaskRepository::new(db.connection()).get(user_id, id).await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let db = self.db.lock().await;
        LibSqlUserRepository::new(db.connection()).get(user_id).await
    }

    /// Number of change-log entries recorded for a user.
    pub async fn log_len(&self, user_id: &str) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlChangeLogRepository::new(db.connection())
            .count_for_user(user_id)
            .await
    }
}

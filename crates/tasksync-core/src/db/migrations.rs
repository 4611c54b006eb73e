//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1).await?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(
                SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'
             )",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: change log and canonical task/user tables
const MIGRATION_V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // Append-only change log; synced_at is unix microseconds, unique and increasing
    "CREATE TABLE IF NOT EXISTS sync_log (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
        entity_type TEXT NOT NULL CHECK (entity_type IN ('task', 'user')),
        entity_id TEXT NOT NULL,
        changes TEXT NOT NULL,
        vector_clock TEXT NOT NULL,
        synced_at INTEGER NOT NULL UNIQUE
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_log_user_synced ON sync_log(user_id, synced_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_log_entity ON sync_log(entity_type, entity_id)",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        title TEXT NOT NULL,
        content TEXT,
        rich_content TEXT,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        manual_priority INTEGER,
        due_date TEXT,
        start_date TEXT,
        completed_at TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        parent_id TEXT,
        root_id TEXT,
        position INTEGER NOT NULL DEFAULT 0,
        task_type TEXT NOT NULL,
        type_metadata TEXT,
        node_type TEXT NOT NULL,
        category TEXT,
        duration_minutes INTEGER,
        computed_priority REAL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id)",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        display_name TEXT,
        preferences TEXT NOT NULL DEFAULT '{}',
        updated_at TEXT NOT NULL
    )",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Version 2: keep the change log append-only at the storage level
const MIGRATION_V2: &[&str] = &[
    "CREATE TRIGGER IF NOT EXISTS sync_log_no_update BEFORE UPDATE ON sync_log
     BEGIN
         SELECT RAISE(ABORT, 'sync_log is append-only');
     END",
    "CREATE TRIGGER IF NOT EXISTS sync_log_no_delete BEFORE DELETE ON sync_log
     BEGIN
         SELECT RAISE(ABORT, 'sync_log is append-only');
     END",
    "INSERT INTO schema_version (version) VALUES (2)",
];

async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_log_rejects_mutation() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO sync_log (
                id, user_id, device_id, operation, entity_type, entity_id,
                changes, vector_clock, synced_at
             )
             VALUES ('l1', 'u1', 'A', 'create', 'task', 'e1', '{}', '{\"A\":1}', 1)",
            (),
        )
        .await
        .unwrap();

        assert!(conn
            .execute("UPDATE sync_log SET device_id = 'B'", ())
            .await
            .is_err());
        assert!(conn.execute("DELETE FROM sync_log", ()).await.is_err());
    }
}

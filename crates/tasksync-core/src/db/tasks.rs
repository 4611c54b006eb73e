//! Canonical task store

use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{params, Connection, Value as SqlValue};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{defaults, Task};
use crate::util::{format_timestamp, parse_timestamp};
use crate::validation::allowed_fields;

const TASK_COLUMNS: &str = "id, user_id, title, content, rich_content, status, priority,
    manual_priority, due_date, start_date, completed_at, tags, parent_id, root_id, position,
    task_type, type_metadata, node_type, category, duration_minutes, computed_priority,
    created_at, updated_at, deleted_at";

/// Trait for canonical task mutations, always scoped by owner (async)
#[allow(async_fn_in_trait)]
pub trait TaskRepository {
    /// Insert a task keyed by `id`, filling defaults for missing fields.
    ///
    /// Returns `false` when a row with that id already exists (replayed create).
    async fn insert(&self, user_id: &str, id: Uuid, fields: &Map<String, Value>) -> Result<bool>;

    /// Merge the given fields into an existing task and refresh `updated_at`.
    ///
    /// Returns the number of rows touched; zero is not an error.
    async fn update_fields(
        &self,
        user_id: &str,
        id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<u64>;

    /// Stamp `deleted_at`; rows are never physically removed
    async fn soft_delete(&self, user_id: &str, id: Uuid) -> Result<u64>;

    /// Fetch a task owned by `user_id`, including soft-deleted rows
    async fn get(&self, user_id: &str, id: Uuid) -> Result<Option<Task>>;

    /// Owner of the task row keyed by `id`, whoever that is
    async fn owner(&self, id: Uuid) -> Result<Option<String>>;
}

/// libSQL implementation of `TaskRepository`
pub struct LibSqlTaskRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlTaskRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Allow-listed columns present in `fields`, excluding `updated_at`
    fn writable_columns(fields: &Map<String, Value>) -> Vec<(&'static str, SqlValue)> {
        allowed_fields(crate::models::EntityType::Task)
            .filter(|name| *name != "updated_at")
            .filter_map(|name| fields.get(name).map(|value| (name, to_sql_value(value))))
            .collect()
    }

    fn updated_at(fields: &Map<String, Value>, now: &str) -> String {
        fields
            .get("updated_at")
            .and_then(Value::as_str)
            .map_or_else(|| now.to_string(), str::to_string)
    }

    fn parse_task(row: &libsql::Row) -> Result<Task> {
        let id: String = row.get(0)?;
        let status: String = row.get(5)?;
        let tags: String = row.get(11)?;
        let task_type: String = row.get(15)?;
        let node_type: String = row.get(17)?;

        Ok(Task {
            id: parse_uuid(&id)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            rich_content: parse_json_column(row.get(4)?)?,
            status: status.parse().map_err(Error::Database)?,
            priority: row.get(6)?,
            manual_priority: row.get(7)?,
            due_date: parse_time_column(row.get(8)?),
            start_date: parse_time_column(row.get(9)?),
            completed_at: parse_time_column(row.get(10)?),
            tags: serde_json::from_str(&tags)?,
            parent_id: row.get::<Option<String>>(12)?.as_deref().map(parse_uuid).transpose()?,
            root_id: row.get::<Option<String>>(13)?.as_deref().map(parse_uuid).transpose()?,
            position: row.get(14)?,
            task_type: task_type.parse().map_err(Error::Database)?,
            type_metadata: parse_json_column(row.get(16)?)?,
            node_type: node_type.parse().map_err(Error::Database)?,
            category: row.get(18)?,
            duration_minutes: row.get(19)?,
            computed_priority: row.get(20)?,
            created_at: required_time_column(&row.get::<String>(21)?, "created_at")?,
            updated_at: required_time_column(&row.get::<String>(22)?, "updated_at")?,
            deleted_at: parse_time_column(row.get(23)?),
        })
    }
}

impl TaskRepository for LibSqlTaskRepository<'_> {
    async fn insert(&self, user_id: &str, id: Uuid, fields: &Map<String, Value>) -> Result<bool> {
        let now = format_timestamp(&Utc::now());

        let mut columns: Vec<(&str, SqlValue)> = vec![
            ("id", SqlValue::Text(id.to_string())),
            ("user_id", SqlValue::Text(user_id.to_string())),
            ("title", SqlValue::Text(defaults::TITLE.to_string())),
            ("status", SqlValue::Text(defaults::STATUS.to_string())),
            ("priority", SqlValue::Integer(defaults::PRIORITY)),
            ("task_type", SqlValue::Text(defaults::TASK_TYPE.to_string())),
            ("node_type", SqlValue::Text(defaults::NODE_TYPE.to_string())),
            ("position", SqlValue::Integer(defaults::POSITION)),
            ("tags", SqlValue::Text("[]".to_string())),
        ];
        for (name, value) in Self::writable_columns(fields) {
            match columns.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = value,
                None => columns.push((name, value)),
            }
        }
        columns.push(("created_at", SqlValue::Text(now.clone())));
        columns.push(("updated_at", SqlValue::Text(Self::updated_at(fields, &now))));

        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO tasks ({}) VALUES ({}) ON CONFLICT(id) DO NOTHING",
            names.join(", "),
            placeholders.join(", ")
        );
        let values = columns.into_iter().map(|(_, value)| value).collect();

        let rows = self.conn.execute(&sql, Params::Positional(values)).await?;
        Ok(rows > 0)
    }

    async fn update_fields(
        &self,
        user_id: &str,
        id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<u64> {
        let now = format_timestamp(&Utc::now());

        let mut columns = Self::writable_columns(fields);
        columns.push(("updated_at", SqlValue::Text(Self::updated_at(fields, &now))));

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(index, (name, _))| format!("{name} = ?{}", index + 1))
            .collect();
        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ?{} AND user_id = ?{}",
            assignments.join(", "),
            columns.len() + 1,
            columns.len() + 2
        );

        let mut values: Vec<SqlValue> = columns.into_iter().map(|(_, value)| value).collect();
        values.push(SqlValue::Text(id.to_string()));
        values.push(SqlValue::Text(user_id.to_string()));

        let rows = self.conn.execute(&sql, Params::Positional(values)).await?;
        Ok(rows)
    }

    async fn soft_delete(&self, user_id: &str, id: Uuid) -> Result<u64> {
        let now = format_timestamp(&Utc::now());

        let rows = self
            .conn
            .execute(
                "UPDATE tasks SET deleted_at = COALESCE(deleted_at, ?1), updated_at = ?1
                 WHERE id = ?2 AND user_id = ?3",
                params![now, id.to_string(), user_id],
            )
            .await?;
        Ok(rows)
    }

    async fn get(&self, user_id: &str, id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND user_id = ?2");
        let mut rows = self
            .conn
            .query(&sql, params![id.to_string(), user_id])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn owner(&self, id: Uuid) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT user_id FROM tasks WHERE id = ?1", params![id.to_string()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

/// Check that a task id is free or already belongs to `user_id`
pub async fn claim_task(repo: &impl TaskRepository, user_id: &str, id: Uuid) -> Result<()> {
    match repo.owner(id).await? {
        Some(owner) if owner != user_id => Err(Error::Forbidden(format!(
            "task {id} does not belong to the caller"
        ))),
        _ => Ok(()),
    }
}

/// Bind a sanitized JSON value to a column; arrays and objects are stored as JSON text.
pub(crate) fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| Error::Database(format!("Invalid UUID column: {value}")))
}

fn parse_json_column(value: Option<String>) -> Result<Option<Value>> {
    value
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(Error::from)
}

fn parse_time_column(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_timestamp)
}

fn required_time_column(value: &str, column: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value)
        .ok_or_else(|| Error::Database(format!("Invalid {column} column: {value}")))
}

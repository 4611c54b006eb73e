//! Canonical user profile store

use chrono::Utc;
use libsql::params::Params;
use libsql::{params, Connection, Value as SqlValue};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::tasks::to_sql_value;
use crate::error::{Error, Result};
use crate::models::{EntityType, UserProfile};
use crate::util::{format_timestamp, parse_timestamp};
use crate::validation::allowed_fields;

/// Trait for user profile storage operations (async)
#[allow(async_fn_in_trait)]
pub trait UserRepository {
    /// Write `display_name`/`preferences` for the caller's own row, creating it if needed.
    ///
    /// Fails with [`Error::Forbidden`] when `target` is not the caller.
    async fn update_profile(
        &self,
        user_id: &str,
        target: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<()>;

    /// Load a user profile
    async fn get(&self, user_id: &str) -> Result<Option<UserProfile>>;
}

/// Check that a user-entity change targets the authenticated user
pub fn ensure_self(user_id: &str, target: Uuid) -> Result<()> {
    let matches = Uuid::parse_str(user_id.trim()).is_ok_and(|own| own == target);
    if matches {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "user entity {target} does not belong to the caller"
        )))
    }
}

/// libSQL implementation of `UserRepository`
pub struct LibSqlUserRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlUserRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl UserRepository for LibSqlUserRepository<'_> {
    async fn update_profile(
        &self,
        user_id: &str,
        target: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<()> {
        ensure_self(user_id, target)?;

        let columns: Vec<(&str, SqlValue)> = allowed_fields(EntityType::User)
            .filter_map(|name| fields.get(name).map(|value| (name, to_sql_value(value))))
            .collect();

        let mut names = vec!["id"];
        let mut values = vec![SqlValue::Text(user_id.trim().to_string())];
        for (name, value) in columns {
            names.push(name);
            values.push(value);
        }
        names.push("updated_at");
        values.push(SqlValue::Text(format_timestamp(&Utc::now())));

        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = names
            .iter()
            .skip(1)
            .map(|name| format!("{name} = excluded.{name}"))
            .collect();
        let sql = format!(
            "INSERT INTO users ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            names.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );

        self.conn.execute(&sql, Params::Positional(values)).await?;
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, display_name, preferences, updated_at FROM users WHERE id = ?1",
                params![user_id.trim()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let preferences: String = row.get(2)?;
        let updated_at: String = row.get(3)?;

        Ok(Some(UserProfile {
            id: row.get(0)?,
            display_name: row.get(1)?,
            preferences: serde_json::from_str(&preferences)?,
            updated_at: parse_timestamp(&updated_at).unwrap_or_default(),
        }))
    }
}

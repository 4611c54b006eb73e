//! Change-log models: operations, entity kinds, log entries and resolved changes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::VectorClock;

/// Mutation recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation `{other}`")),
        }
    }
}

/// Kind of canonical entity a change targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Task,
    User,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::User => "user",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "user" => Ok(Self::User),
            other => Err(format!("unknown entity_type `{other}`")),
        }
    }
}

/// Identifier of a change-log row, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogEntryId(Uuid);

impl LogEntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for LogEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LogEntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A change accepted from a device, before the log assigns `synced_at`
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub user_id: String,
    pub device_id: String,
    pub operation: Operation,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub changes: Map<String, Value>,
    pub vector_clock: VectorClock,
}

/// An immutable row of the append-only change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: LogEntryId,
    pub user_id: String,
    pub device_id: String,
    pub operation: Operation,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    /// Sanitized field map as accepted at push time
    pub changes: Map<String, Value>,
    pub vector_clock: VectorClock,
    /// Server receipt time, strictly increasing across the log
    pub synced_at: DateTime<Utc>,
}

/// The single state the pull protocol emits per entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedChange {
    pub operation: Operation,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub data: Map<String, Value>,
    pub vector_clock: VectorClock,
    pub synced_at: DateTime<Utc>,
    /// Set when the winner's clock is concurrent with another entry in its group
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
}

impl From<SyncLogEntry> for ResolvedChange {
    fn from(entry: SyncLogEntry) -> Self {
        Self {
            operation: entry.operation,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            data: entry.changes,
            vector_clock: entry.vector_clock,
            synced_at: entry.synced_at,
            conflict: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_parse() {
        assert_eq!("create".parse::<Operation>(), Ok(Operation::Create));
        assert_eq!("delete".parse::<Operation>(), Ok(Operation::Delete));
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_entity_type_parse_is_case_sensitive() {
        assert_eq!("task".parse::<EntityType>(), Ok(EntityType::Task));
        assert!("Task".parse::<EntityType>().is_err());
        assert!("project".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_log_entry_id_unique() {
        assert_ne!(LogEntryId::new(), LogEntryId::new());
    }

    #[test]
    fn test_resolved_change_omits_conflict_flag_when_false() {
        let change = ResolvedChange {
            operation: Operation::Update,
            entity_type: EntityType::Task,
            entity_id: Uuid::nil(),
            data: Map::new(),
            vector_clock: VectorClock::new(),
            synced_at: Utc::now(),
            conflict: false,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert!(json.get("conflict").is_none());
        assert_eq!(json["operation"], "update");
        assert_eq!(json["entity_type"], "task");
    }
}

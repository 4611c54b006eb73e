//! Task model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every accepted wire value, in declaration order
            pub const ALL: &'static [&'static str] = &[$($text),+];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "`{other}` is not one of {}",
                        Self::ALL.join(", ")
                    )),
                }
            }
        }
    };
}

string_enum!(
    /// Lifecycle state of a task
    TaskStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
        Archived => "archived",
    }
);

string_enum!(
    /// What kind of thing the task represents
    TaskType {
        Todo => "todo",
        Habit => "habit",
        Event => "event",
        Reminder => "reminder",
        Project => "project",
    }
);

string_enum!(
    /// Position of the row in the task tree
    NodeType {
        Item => "item",
        List => "list",
        Section => "section",
    }
);

/// Defaults applied when a create omits optional fields
pub mod defaults {
    pub const TITLE: &str = "Untitled";
    pub const STATUS: &str = "pending";
    pub const PRIORITY: i64 = 5;
    pub const TASK_TYPE: &str = "todo";
    pub const NODE_TYPE: &str = "item";
    pub const POSITION: i64 = 0;
}

/// Canonical task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub content: Option<String>,
    pub rich_content: Option<Value>,
    pub status: TaskStatus,
    pub priority: i64,
    pub manual_priority: Option<i64>,
    pub due_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub parent_id: Option<Uuid>,
    pub root_id: Option<Uuid>,
    pub position: i64,
    pub task_type: TaskType,
    pub type_metadata: Option<Value>,
    pub node_type: NodeType,
    pub category: Option<String>,
    pub duration_minutes: Option<i64>,
    pub computed_priority: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker; rows are never physically removed
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

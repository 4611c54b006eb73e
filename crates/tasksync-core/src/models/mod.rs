//! Data models for tasksync

mod change;
mod task;
mod user;
mod vector_clock;

pub use change::{
    EntityType, LogEntryId, NewLogEntry, Operation, ResolvedChange, SyncLogEntry,
};
pub use task::{defaults, NodeType, Task, TaskStatus, TaskType};
pub use user::UserProfile;
pub use vector_clock::{ClockOrdering, VectorClock};

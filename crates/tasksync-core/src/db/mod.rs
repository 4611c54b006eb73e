//! Database layer for tasksync

mod change_log;
mod connection;
mod migrations;
mod tasks;
mod users;

pub use change_log::{ChangeLogRepository, LibSqlChangeLogRepository};
pub use connection::Database;
pub use tasks::{claim_task, LibSqlTaskRepository, TaskRepository};
pub use users::{ensure_self, LibSqlUserRepository, UserRepository};

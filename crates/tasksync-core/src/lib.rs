//! tasksync-core - Core library for tasksync
//!
//! This crate contains the sync engine shared by the tasksync server: the
//! field validator, vector clocks, the append-only change log, the canonical
//! task/user store, and the push and pull coordinators.

pub mod db;
pub mod error;
pub mod models;
pub mod sync;
pub mod util;
pub mod validation;

pub use error::{Error, Result};
pub use models::{
    EntityType, Operation, ResolvedChange, SyncLogEntry, Task, UserProfile, VectorClock,
};
pub use sync::{PullRequest, PullResponse, PushOutcome, SyncStore};

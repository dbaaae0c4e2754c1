//! Object locks.
//!
//! # Responsibility
//! - Persist pessimistic and optimistic locks per object and principal.
//! - Expire locks older than the session lifetime.
//!
//! # Invariants
//! - At most one pessimistic lock exists per object id (unique index).
//! - Reading an expired lock removes every lock on that object and
//!   reports none; that cleanup never fails the read.
//! - Release operations are idempotent.

use crate::model::id::EntityId;
use std::fmt::{Display, Formatter};

mod manager;

pub use manager::{LockManager, LockResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Optimistic,
    Pessimistic,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::Pessimistic => "pessimistic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "optimistic" => Some(Self::Optimistic),
            "pessimistic" => Some(Self::Pessimistic),
            _ => None,
        }
    }
}

impl Display for LockType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub object_id: EntityId,
    pub lock_type: LockType,
    pub holder_user_id: String,
    pub holder_login: String,
    pub session_id: String,
    /// Unix milliseconds.
    pub created_at: i64,
    /// State snapshot taken when an optimistic lock was acquired.
    pub snapshot: Option<String>,
}

impl Lock {
    pub fn is_held_by(&self, user_id: &str) -> bool {
        self.holder_user_id == user_id
    }
}

/// Outcome of `LockManager::check_edit_access`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditAccess {
    /// The current principal holds the pessimistic lock.
    Granted(Lock),
    /// Viewing is fine, editing is not; `holder` is set for lock conflicts.
    ReadOnly {
        message: String,
        holder: Option<Lock>,
    },
    /// No authenticated principal, so no lock can be taken.
    NoPrincipal,
}

//! Unit of work.
//!
//! # Responsibility
//! - Track entities touched during one logical operation.
//! - Persist queued inserts, updates and deletes atomically on commit.
//!
//! # Invariants
//! - An id is queued in at most one of new/dirty/deleted.
//! - A commit either persists every queued change or rolls back storage.
//! - Registries never outlive one unit of work; commit and rollback clear them.

use crate::error::PersistenceResult;
use crate::model::entity::Entity;

mod transaction;

pub use transaction::{Transaction, TransactionStatus};

/// Storage side of a commit.
///
/// `begin` may be called on an already started storage transaction and
/// must then do nothing.
pub trait CommitTarget {
    fn begin(&self) -> PersistenceResult<()>;

    fn commit(&self) -> PersistenceResult<()>;

    fn rollback(&self) -> PersistenceResult<()>;

    /// Inserts or updates according to the entity state.
    fn persist(&self, entity: &mut Entity) -> PersistenceResult<()>;

    fn remove(&self, entity: &mut Entity) -> PersistenceResult<()>;
}

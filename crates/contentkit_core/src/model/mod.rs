//! Generic entity model shared by mappers, the unit of work and queries.
//!
//! # Responsibility
//! - Define identities, typed values and the generic persistent entity.
//! - Define the observer contract used for change tracking.
//!
//! # Invariants
//! - Entities reference other entities by `EntityId` only.
//! - Entities know their type by name; mappers are resolved elsewhere.

pub mod entity;
pub mod id;
pub mod observer;
pub mod value;

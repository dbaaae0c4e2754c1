//! Change notification contract between entities and their observers.
//!
//! # Invariants
//! - Entities hold weak observer handles only; dropping an observer ends its
//!   subscriptions without touching the entity.
//! - Callbacks never receive the entity itself. The entity is mutably
//!   borrowed while it notifies, so observers work with ids only.

use crate::model::entity::EntityState;
use crate::model::id::EntityId;
use crate::model::value::Value;
use std::rc::Weak;

/// Receives value, state and identity changes of observed entities.
///
/// The unit of work is one implementation; independent observers (for
/// example a search indexer) subscribe alongside it.
pub trait ChangeObserver {
    fn on_value_changed(&self, id: &EntityId, name: &str, old: &Value, new: &Value);

    fn on_state_changed(&self, id: &EntityId, old: EntityState, new: EntityState);

    /// Called after the entity received a new identity (key assignment).
    fn on_id_changed(&self, _old: &EntityId, _new: &EntityId) {}
}

/// Handle identifying one subscription on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) observer: Weak<dyn ChangeObserver>,
}

//! Generic persistent entity.
//!
//! # Responsibility
//! - Carry typed values for attributes and relation roles of one instance.
//! - Enforce the state lattice (`Clean`, `Dirty`, `New`, `Deleted`).
//! - Notify subscribed observers about value, state and identity changes.
//!
//! # Invariants
//! - Once `Deleted`, the state never changes again.
//! - A `New` entity stays `New` when values change.
//! - Key values live in the id only; changing a key field recomputes the id
//!   and is never reported as an ordinary value change.
//! - Keys of real (persisted) entities cannot be changed.

use crate::model::id::{EntityId, IdError};
use crate::model::observer::{ChangeObserver, Subscription, SubscriptionId};
use crate::model::value::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::rc::{Rc, Weak};

/// Shared handle to one tracked entity instance.
pub type EntityRef = Rc<RefCell<Entity>>;

/// Persistence lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    Clean,
    Dirty,
    New,
    Deleted,
}

/// Recognized per-value properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueProperty {
    Editable,
    Visible,
    RestrictionsMatch,
    RestrictionsNotMatch,
    RestrictionsDescription,
    InputType,
    DisplayType,
}

/// Entity mutation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    /// Entity is flagged immutable.
    Immutable(EntityId),
    /// Key field of a persisted entity cannot change.
    KeyImmutable { id: EntityId, field: String },
    /// Key value cannot be represented as an id component.
    InvalidKey(IdError),
    /// Replacement id does not fit this entity.
    IdMismatch { current: EntityId, proposed: EntityId },
}

impl Display for EntityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immutable(id) => write!(f, "entity {id} is immutable"),
            Self::KeyImmutable { id, field } => {
                write!(f, "key field `{field}` of persisted entity {id} cannot change")
            }
            Self::InvalidKey(err) => write!(f, "{err}"),
            Self::IdMismatch { current, proposed } => {
                write!(f, "cannot replace id {current} with {proposed}")
            }
        }
    }
}

impl Error for EntityError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidKey(err) => Some(err),
            _ => None,
        }
    }
}

impl From<IdError> for EntityError {
    fn from(value: IdError) -> Self {
        Self::InvalidKey(value)
    }
}

/// Generic persistent object.
pub struct Entity {
    id: EntityId,
    pk_names: Vec<String>,
    values: BTreeMap<String, Value>,
    properties: BTreeMap<String, BTreeMap<ValueProperty, String>>,
    state: EntityState,
    immutable: bool,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
}

impl Entity {
    /// Creates an entity in the given state without values.
    pub fn new(id: EntityId, pk_names: Vec<String>, state: EntityState) -> Self {
        Self {
            id,
            pk_names,
            values: BTreeMap::new(),
            properties: BTreeMap::new(),
            state,
            immutable: false,
            subscriptions: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Wraps this entity into a shared handle.
    pub fn into_ref(self) -> EntityRef {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        self.id.type_name()
    }

    pub fn pk_names(&self) -> &[String] {
        &self.pk_names
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == EntityState::New
    }

    pub fn is_deleted(&self) -> bool {
        self.state == EntityState::Deleted
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn set_immutable(&mut self, immutable: bool) {
        self.immutable = immutable;
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Key component for one key field, read from the id.
    pub fn key_value(&self, name: &str) -> Option<&str> {
        let index = self.pk_names.iter().position(|pk| pk == name)?;
        self.id.components().get(index).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn value_names(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Sets one value and notifies observers.
    ///
    /// Returns `Ok(true)` when the stored value changed. Key fields update
    /// the id instead (see module invariants).
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) -> Result<bool, EntityError> {
        if self.immutable {
            return Err(EntityError::Immutable(self.id.clone()));
        }
        let value = value.into();

        if let Some(index) = self.pk_names.iter().position(|pk| pk == name) {
            return self.set_key_value(index, name, &value);
        }

        let old = self.values.get(name).cloned().unwrap_or(Value::Null);
        if self.values.contains_key(name) && old == value {
            return Ok(false);
        }
        self.values.insert(name.to_string(), value.clone());

        let id = self.id.clone();
        self.notify(|observer| observer.on_value_changed(&id, name, &old, &value));
        if self.state == EntityState::Clean {
            self.set_state(EntityState::Dirty);
        }
        Ok(true)
    }

    /// Stores a value coming from storage; no notification, no state change.
    pub fn load_value(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    /// Merges values of a freshly loaded copy into this instance
    /// (last load wins per value).
    pub fn merge_loaded(&mut self, other: &Entity) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
        for (name, properties) in &other.properties {
            self.properties
                .entry(name.clone())
                .or_default()
                .extend(properties.iter().map(|(key, value)| (*key, value.clone())));
        }
    }

    /// To-one relation value for `role`.
    pub fn reference(&self, role: &str) -> Option<&EntityId> {
        self.values.get(role).and_then(Value::as_reference)
    }

    /// Ids held by a relation role (to-one or to-many).
    pub fn references(&self, role: &str) -> Vec<EntityId> {
        self.values
            .get(role)
            .map(|value| value.referenced_ids().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Links this entity to `target` through a to-one role.
    pub fn set_reference(
        &mut self,
        role: &str,
        target: Option<EntityId>,
    ) -> Result<bool, EntityError> {
        self.set_value(role, target.map_or(Value::Null, Value::Reference))
    }

    /// Returns whether any relation value points at a provisional id.
    pub fn has_provisional_references(&self) -> bool {
        self.values
            .values()
            .flat_map(Value::referenced_ids)
            .any(EntityId::has_provisional_component)
    }

    /// Rewrites references from `old` to `new`; returns whether anything
    /// changed. A rewritten to-one reference makes a `Clean` entity
    /// `Dirty`; to-many values are derived and do not.
    pub fn replace_reference(&mut self, old: &EntityId, new: &EntityId) -> bool {
        let mut changed_names = Vec::new();
        for (name, value) in self.values.iter_mut() {
            let before = value.clone();
            if value.replace_reference(old, new) {
                changed_names.push((name.clone(), before, value.clone()));
            }
        }
        if changed_names.is_empty() {
            return false;
        }
        let id = self.id.clone();
        for (name, before, after) in &changed_names {
            self.notify(|observer| observer.on_value_changed(&id, name, before, after));
        }
        let stored_change = changed_names
            .iter()
            .any(|(_, _, after)| matches!(after, Value::Reference(_)));
        if stored_change && self.state == EntityState::Clean {
            self.set_state(EntityState::Dirty);
        }
        true
    }

    /// Requests a state transition respecting the state lattice.
    pub fn set_state(&mut self, state: EntityState) {
        let current = self.state;
        if current == state || current == EntityState::Deleted {
            return;
        }
        if current == EntityState::New && state == EntityState::Dirty {
            return;
        }
        self.state = state;
        let id = self.id.clone();
        self.notify(|observer| observer.on_state_changed(&id, current, state));
    }

    /// Marks the entity for deletion.
    pub fn delete(&mut self) {
        self.set_state(EntityState::Deleted);
    }

    /// Marks the entity as in sync with storage.
    pub fn mark_clean(&mut self) {
        self.set_state(EntityState::Clean);
    }

    /// Replaces the identity (key assignment after insert).
    ///
    /// The new id must have the same type and arity.
    pub fn replace_id(&mut self, new_id: EntityId) -> Result<(), EntityError> {
        if new_id.type_name() != self.id.type_name()
            || new_id.components().len() != self.id.components().len()
        {
            return Err(EntityError::IdMismatch {
                current: self.id.clone(),
                proposed: new_id,
            });
        }
        if new_id == self.id {
            return Ok(());
        }
        let old = std::mem::replace(&mut self.id, new_id);
        let new = self.id.clone();
        self.notify(|observer| observer.on_id_changed(&old, &new));
        Ok(())
    }

    pub fn value_property(&self, name: &str, property: ValueProperty) -> Option<&str> {
        self.properties
            .get(name)
            .and_then(|properties| properties.get(&property))
            .map(String::as_str)
    }

    pub fn set_value_property(
        &mut self,
        name: &str,
        property: ValueProperty,
        value: impl Into<String>,
    ) {
        self.properties
            .entry(name.to_string())
            .or_default()
            .insert(property, value.into());
    }

    /// Editable unless a property says otherwise.
    pub fn is_editable(&self, name: &str) -> bool {
        self.value_property(name, ValueProperty::Editable) != Some("false")
    }

    /// Visible unless a property says otherwise.
    pub fn is_visible(&self, name: &str) -> bool {
        self.value_property(name, ValueProperty::Visible) != Some("false")
    }

    /// Canonical JSON of the attribute values (relation roles excluded).
    pub fn state_snapshot(&self) -> String {
        let attributes = self
            .values
            .iter()
            .filter(|(_, value)| !value.is_relation())
            .collect::<BTreeMap<_, _>>();
        serde_json::to_string(&attributes).unwrap_or_default()
    }

    /// Adds an observer and returns its subscription handle.
    pub fn subscribe(&mut self, observer: Weak<dyn ChangeObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.push(Subscription { id, observer });
        id
    }

    /// Removes one subscription; returns whether it existed.
    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|entry| entry.id != subscription);
        before != self.subscriptions.len()
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.observer.strong_count() > 0)
            .count()
    }

    fn set_key_value(&mut self, index: usize, name: &str, value: &Value) -> Result<bool, EntityError> {
        let component = value.as_text().ok_or_else(|| {
            EntityError::InvalidKey(IdError::Malformed(format!("{}.{name}", self.id)))
        })?;
        if self.id.components()[index] == component {
            return Ok(false);
        }
        if self.state != EntityState::New && !self.id.has_provisional_component() {
            return Err(EntityError::KeyImmutable {
                id: self.id.clone(),
                field: name.to_string(),
            });
        }
        let new_id = self.id.with_component(index, component)?;
        self.replace_id(new_id)?;
        Ok(true)
    }

    fn notify(&mut self, callback: impl Fn(&dyn ChangeObserver)) {
        self.subscriptions
            .retain(|entry| entry.observer.strong_count() > 0);
        let observers = self
            .subscriptions
            .iter()
            .filter_map(|entry| entry.observer.upgrade())
            .collect::<Vec<_>>();
        for observer in observers {
            callback(observer.as_ref());
        }
    }
}

impl Clone for Entity {
    /// Detached copy: values, properties and state without subscriptions.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            pk_names: self.pk_names.clone(),
            values: self.values.clone(),
            properties: self.properties.clone(),
            state: self.state,
            immutable: self.immutable,
            subscriptions: Vec::new(),
            next_subscription: 0,
        }
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("values", &self.values)
            .field("immutable", &self.immutable)
            .field("observers", &self.subscriptions.len())
            .finish()
    }
}

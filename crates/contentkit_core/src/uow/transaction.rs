//! Transaction registries and commit loop.

use crate::config::DEFAULT_MAX_COMMIT_ROUNDS;
use crate::error::{PersistenceError, PersistenceResult};
use crate::model::entity::{Entity, EntityRef, EntityState};
use crate::model::id::EntityId;
use crate::model::observer::{ChangeObserver, SubscriptionId};
use crate::model::value::Value;
use crate::uow::CommitTarget;
use log::{debug, error, info, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Inactive,
    Active,
}

struct Tracked {
    entity: EntityRef,
    subscription: Option<SubscriptionId>,
}

#[derive(Default)]
struct Registries {
    /// Identity map of every tracked entity.
    loaded: HashMap<String, Tracked>,
    new: Vec<String>,
    dirty: Vec<String>,
    deleted: Vec<String>,
}

impl Registries {
    fn enqueue(&mut self, key: &str, state: EntityState) {
        let in_new = self.new.iter().any(|queued| queued == key);
        let in_dirty = self.dirty.iter().any(|queued| queued == key);
        let in_deleted = self.deleted.iter().any(|queued| queued == key);
        match state {
            EntityState::New => {
                if !in_new && !in_deleted {
                    self.dirty.retain(|queued| queued != key);
                    self.new.push(key.to_string());
                }
            }
            EntityState::Dirty => {
                if !in_new && !in_dirty && !in_deleted {
                    self.dirty.push(key.to_string());
                }
            }
            EntityState::Deleted => {
                // A queued insert never reached storage; dropping it is enough.
                if in_new {
                    self.new.retain(|queued| queued != key);
                    return;
                }
                if in_dirty {
                    self.dirty.retain(|queued| queued != key);
                }
                if !in_deleted {
                    self.deleted.push(key.to_string());
                }
            }
            EntityState::Clean => {
                self.new.retain(|queued| queued != key);
                self.dirty.retain(|queued| queued != key);
            }
        }
    }

    fn rekey(&mut self, old: &str, new: &str) {
        if let Some(tracked) = self.loaded.remove(old) {
            self.loaded.insert(new.to_string(), tracked);
        }
        for queue in [&mut self.new, &mut self.dirty, &mut self.deleted] {
            for key in queue.iter_mut().filter(|key| key.as_str() == old) {
                *key = new.to_string();
            }
        }
    }

    fn forget(&mut self, key: &str) -> Option<Tracked> {
        self.new.retain(|queued| queued != key);
        self.dirty.retain(|queued| queued != key);
        self.deleted.retain(|queued| queued != key);
        self.loaded.remove(key)
    }

    fn is_settled(&self) -> bool {
        self.new.is_empty() && self.dirty.is_empty() && self.deleted.is_empty()
    }
}

/// Id and state of one entity before the commit first wrote it.
struct Written {
    entity: EntityRef,
    id: EntityId,
    state: EntityState,
}

/// Observer half of the transaction; entities hold it weakly.
struct TransactionShared {
    status: Cell<TransactionStatus>,
    registries: RefCell<Registries>,
}

impl TransactionShared {
    fn is_active(&self) -> bool {
        self.status.get() == TransactionStatus::Active
    }
}

impl ChangeObserver for TransactionShared {
    fn on_value_changed(&self, _id: &EntityId, _name: &str, _old: &Value, _new: &Value) {}

    fn on_state_changed(&self, id: &EntityId, _old: EntityState, new: EntityState) {
        if !self.is_active() {
            return;
        }
        match self.registries.try_borrow_mut() {
            Ok(mut registries) => registries.enqueue(&id.to_string(), new),
            Err(_) => warn!(
                "event=tx_observe module=uow status=skipped reason=registries_busy id={id}"
            ),
        }
    }

    fn on_id_changed(&self, old: &EntityId, new: &EntityId) {
        let others = {
            let Ok(mut registries) = self.registries.try_borrow_mut() else {
                warn!("event=tx_rekey module=uow status=skipped reason=registries_busy id={old}");
                return;
            };
            registries.rekey(&old.to_string(), &new.to_string());
            registries
                .loaded
                .values()
                .map(|tracked| tracked.entity.clone())
                .collect::<Vec<_>>()
        };
        // The entity being re-keyed is borrowed by its caller and skipped here.
        for other in others {
            if let Ok(mut entity) = other.try_borrow_mut() {
                entity.replace_reference(old, new);
            }
        }
        debug!("event=tx_rekey module=uow status=ok old={old} new={new}");
    }
}

/// Unit of work over a set of tracked entities.
///
/// Status moves `Inactive -> Active -> Inactive`; both commit and rollback
/// end in `Inactive` with empty registries, so one instance is reusable.
pub struct Transaction {
    shared: Rc<TransactionShared>,
    max_commit_rounds: usize,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMIT_ROUNDS)
    }
}

impl Transaction {
    pub fn new(max_commit_rounds: usize) -> Self {
        Self {
            shared: Rc::new(TransactionShared {
                status: Cell::new(TransactionStatus::Inactive),
                registries: RefCell::new(Registries::default()),
            }),
            max_commit_rounds: max_commit_rounds.max(1),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.shared.status.get()
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Starts a unit of work with empty registries.
    pub fn begin(&self) {
        self.reset();
        self.shared.status.set(TransactionStatus::Active);
        debug!("event=tx_begin module=uow status=ok");
    }

    /// Registers a freshly loaded entity.
    ///
    /// When the id is already tracked, the loaded values are merged into the
    /// tracked instance and that instance is returned.
    pub fn register_loaded(&self, entity: Entity) -> EntityRef {
        let key = entity.id().to_string();
        if let Some(existing) = self.get_by_key(&key) {
            match existing.try_borrow_mut() {
                Ok(mut tracked) => tracked.merge_loaded(&entity),
                Err(_) => warn!("event=tx_merge module=uow status=skipped reason=entity_busy id={key}"),
            }
            return existing;
        }
        self.track(entity.into_ref())
    }

    /// Tracks an externally constructed handle.
    ///
    /// Returns the tracked instance, which differs from `handle` when the
    /// id was already tracked (values of `handle` are merged into it).
    pub fn attach(&self, handle: EntityRef) -> EntityRef {
        let Ok(key) = handle.try_borrow().map(|entity| entity.id().to_string()) else {
            return handle;
        };
        if let Some(existing) = self.get_by_key(&key) {
            if !Rc::ptr_eq(&existing, &handle) {
                if let (Ok(mut tracked), Ok(incoming)) =
                    (existing.try_borrow_mut(), handle.try_borrow())
                {
                    tracked.merge_loaded(&incoming);
                }
            }
            return existing;
        }
        self.track(handle)
    }

    pub fn register_new(&self, handle: EntityRef) -> EntityRef {
        self.register_with_state(handle, EntityState::New)
    }

    pub fn register_dirty(&self, handle: EntityRef) -> EntityRef {
        self.register_with_state(handle, EntityState::Dirty)
    }

    pub fn register_deleted(&self, handle: EntityRef) -> EntityRef {
        self.register_with_state(handle, EntityState::Deleted)
    }

    pub fn get(&self, id: &EntityId) -> Option<EntityRef> {
        self.get_by_key(&id.to_string())
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.shared
            .registries
            .borrow()
            .loaded
            .contains_key(&id.to_string())
    }

    /// Tracked handles.
    pub fn tracked(&self) -> Vec<EntityRef> {
        self.shared
            .registries
            .borrow()
            .loaded
            .values()
            .map(|tracked| tracked.entity.clone())
            .collect()
    }

    pub fn pending_new(&self) -> Vec<String> {
        self.shared.registries.borrow().new.clone()
    }

    pub fn pending_dirty(&self) -> Vec<String> {
        self.shared.registries.borrow().dirty.clone()
    }

    pub fn pending_deleted(&self) -> Vec<String> {
        self.shared.registries.borrow().deleted.clone()
    }

    /// Removes an entity from every registry without touching storage.
    pub fn detach(&self, id: &EntityId) -> Option<EntityRef> {
        let tracked = self
            .shared
            .registries
            .borrow_mut()
            .forget(&id.to_string())?;
        unsubscribe(&tracked);
        Some(tracked.entity)
    }

    /// Persists every queued change through `target`.
    ///
    /// # Errors
    /// - `TransactionNotActive` when `begin` was not called.
    /// - `CommitCascadeLimit` when the queues do not settle.
    /// - Any persistence error; storage is rolled back first.
    pub fn commit(&self, target: &dyn CommitTarget) -> PersistenceResult<()> {
        if !self.is_active() {
            return Err(PersistenceError::TransactionNotActive);
        }
        info!("event=tx_commit module=uow status=start");

        let mut written = Vec::new();
        let outcome = self.drain(target, &mut written).and_then(|rounds| {
            target.commit()?;
            Ok(rounds)
        });
        match outcome {
            Ok(rounds) => {
                self.reset();
                info!("event=tx_commit module=uow status=ok rounds={rounds}");
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = target.rollback() {
                    error!(
                        "event=tx_rollback module=uow status=error error={}",
                        rollback_err
                    );
                }
                restore(written);
                self.reset();
                error!("event=tx_commit module=uow status=error error={err}");
                Err(err)
            }
        }
    }

    /// Discards every registry without touching storage.
    pub fn rollback(&self) {
        self.reset();
        debug!("event=tx_rollback module=uow status=ok");
    }

    fn drain(&self, target: &dyn CommitTarget, written: &mut Vec<Written>) -> PersistenceResult<usize> {
        target.begin()?;
        let mut rounds = 0;
        loop {
            if self.shared.registries.borrow().is_settled() {
                return Ok(rounds);
            }
            if rounds >= self.max_commit_rounds {
                return Err(PersistenceError::CommitCascadeLimit { rounds });
            }
            rounds += 1;

            let mut inserts = std::mem::take(&mut self.shared.registries.borrow_mut().new);
            while !inserts.is_empty() {
                let next = inserts
                    .iter()
                    .position(|key| self.is_insert_ready(key))
                    .unwrap_or(0);
                let key = inserts.remove(next);
                self.with_entity(&key, written, |entity| target.persist(entity))?;
            }

            let updates = std::mem::take(&mut self.shared.registries.borrow_mut().dirty);
            for key in updates {
                self.with_entity(&key, written, |entity| target.persist(entity))?;
            }

            let deletes = std::mem::take(&mut self.shared.registries.borrow_mut().deleted);
            for key in deletes {
                self.with_entity(&key, written, |entity| {
                    if entity.id().has_provisional_component() {
                        return Ok(());
                    }
                    target.remove(entity)
                })?;
                let forgotten = self.shared.registries.borrow_mut().forget(&key);
                if let Some(tracked) = forgotten {
                    unsubscribe(&tracked);
                }
            }
        }
    }

    /// Inserts referencing only real ids go first so parents get keys
    /// before their children are written.
    fn is_insert_ready(&self, key: &str) -> bool {
        let Some(handle) = self.get_by_key(key) else {
            return false;
        };
        let ready = handle
            .try_borrow()
            .map(|entity| !entity.has_provisional_references())
            .unwrap_or(false);
        ready
    }

    /// Runs `action` on the tracked entity, journaling its pre-commit id
    /// and state on first contact.
    fn with_entity(
        &self,
        key: &str,
        written: &mut Vec<Written>,
        action: impl FnOnce(&mut Entity) -> PersistenceResult<()>,
    ) -> PersistenceResult<()> {
        let Some(handle) = self.get_by_key(key) else {
            return Ok(());
        };
        let mut entity = handle.try_borrow_mut().map_err(|_| {
            PersistenceError::InvalidData(format!("entity {key} is borrowed during commit"))
        })?;
        if !written.iter().any(|entry| Rc::ptr_eq(&entry.entity, &handle)) {
            written.push(Written {
                entity: handle.clone(),
                id: entity.id().clone(),
                state: entity.state(),
            });
        }
        action(&mut *entity)
    }

    fn register_with_state(&self, handle: EntityRef, state: EntityState) -> EntityRef {
        let tracked = self.attach(handle);
        if self.is_active() {
            let key = tracked.try_borrow().map(|entity| entity.id().to_string());
            if let Ok(key) = key {
                self.shared.registries.borrow_mut().enqueue(&key, state);
            }
        }
        tracked
    }

    fn track(&self, handle: EntityRef) -> EntityRef {
        let (key, state, subscription) = {
            let Ok(mut entity) = handle.try_borrow_mut() else {
                return handle.clone();
            };
            let subscription = if self.is_active() {
                let shared: Rc<dyn ChangeObserver> = self.shared.clone();
                let observer: Weak<dyn ChangeObserver> = Rc::downgrade(&shared);
                Some(entity.subscribe(observer))
            } else {
                None
            };
            (entity.id().to_string(), entity.state(), subscription)
        };

        let mut registries = self.shared.registries.borrow_mut();
        registries.loaded.insert(
            key.clone(),
            Tracked {
                entity: handle.clone(),
                subscription,
            },
        );
        if self.is_active() && state != EntityState::Clean {
            registries.enqueue(&key, state);
        }
        handle
    }

    fn get_by_key(&self, key: &str) -> Option<EntityRef> {
        self.shared
            .registries
            .borrow()
            .loaded
            .get(key)
            .map(|tracked| tracked.entity.clone())
    }

    fn reset(&self) {
        let tracked = std::mem::take(&mut *self.shared.registries.borrow_mut());
        for entry in tracked.loaded.values() {
            unsubscribe(entry);
        }
        self.shared.status.set(TransactionStatus::Inactive);
    }
}

/// Puts written entities back to their pre-commit id and state after the
/// storage rollback.
///
/// Runs while observers are still subscribed, so references held by other
/// tracked entities follow the id change back.
fn restore(written: Vec<Written>) {
    for entry in written.into_iter().rev() {
        let Ok(mut entity) = entry.entity.try_borrow_mut() else {
            warn!("event=tx_restore module=uow status=skipped reason=entity_busy id={}", entry.id);
            continue;
        };
        if entity.id() != &entry.id {
            if let Err(err) = entity.replace_id(entry.id.clone()) {
                error!("event=tx_restore module=uow status=error id={} error={err}", entry.id);
                continue;
            }
        }
        entity.set_state(entry.state);
        debug!("event=tx_restore module=uow status=ok id={} state={:?}", entry.id, entry.state);
    }
}

fn unsubscribe(tracked: &Tracked) {
    if let Some(subscription) = tracked.subscription {
        if let Ok(mut entity) = tracked.entity.try_borrow_mut() {
            entity.unsubscribe(subscription);
        }
    }
}

//! Persistence facade.
//!
//! # Responsibility
//! - Expose load/create/save/delete/query to the hosting application.
//! - Apply authorization, validation and lock checks around every write,
//!   whether it happens immediately or at unit-of-work commit.
//! - Keep one identity map (the owned `Transaction`) for all handles.
//!
//! # Invariants
//! - Read denials degrade to "no result"; write denials fail.
//! - An immediate write runs in its own storage transaction and leaves no
//!   partial rows behind on failure.
//! - With an active unit of work, `save`/`delete` only queue; storage is
//!   touched on `commit`.

use crate::config::{CoreConfig, LockingMode};
use crate::context::{Action, Authorizer, Clock, SessionContext};
use crate::db::schema::ensure_entity_tables;
use crate::db::SqliteStore;
use crate::error::{PersistenceError, PersistenceResult};
use crate::lock::{EditAccess, LockManager, LockType};
use crate::mapper::{
    filter_for, validate_entity, AttributeFilter, BuildDepth, LoadedGraph, MapperRegistry,
    SqliteMapper,
};
use crate::meta::MetadataRegistry;
use crate::model::entity::{Entity, EntityRef, EntityState};
use crate::model::id::EntityId;
use crate::model::value::Value;
use crate::query::{run_select, PagingInfo, QueryOutput, QuerySpec};
use crate::uow::{CommitTarget, Transaction};
use log::{debug, info, warn};
use std::rc::Rc;
use std::sync::Arc;

/// Query result handed to callers.
#[derive(Debug)]
pub enum QueryHits {
    Ids(Vec<EntityId>),
    Entities(Vec<EntityRef>),
}

impl QueryHits {
    pub fn ids(&self) -> Vec<EntityId> {
        match self {
            Self::Ids(ids) => ids.clone(),
            Self::Entities(items) => items
                .iter()
                .filter_map(|item| item.try_borrow().ok().map(|entity| entity.id().clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::Entities(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PersistenceFacade {
    metadata: Arc<MetadataRegistry>,
    mappers: MapperRegistry,
    transaction: Transaction,
    locks: LockManager,
    authorizer: Rc<dyn Authorizer>,
    session: Rc<dyn SessionContext>,
    config: CoreConfig,
}

impl PersistenceFacade {
    pub fn new(
        mappers: MapperRegistry,
        locks: LockManager,
        session: Rc<dyn SessionContext>,
        authorizer: Rc<dyn Authorizer>,
        config: CoreConfig,
    ) -> Self {
        Self {
            metadata: Arc::clone(mappers.metadata()),
            transaction: Transaction::new(config.max_commit_rounds),
            mappers,
            locks,
            authorizer,
            session,
            config,
        }
    }

    /// Wires one `SqliteMapper` per type over `store` and creates missing
    /// entity tables.
    pub fn open_sqlite(
        metadata: Arc<MetadataRegistry>,
        store: Rc<SqliteStore>,
        session: Rc<dyn SessionContext>,
        clock: Rc<dyn Clock>,
        authorizer: Rc<dyn Authorizer>,
        config: CoreConfig,
    ) -> PersistenceResult<Self> {
        ensure_entity_tables(store.connection(), &metadata)?;
        let mut mappers = MapperRegistry::new(Arc::clone(&metadata));
        for type_name in metadata.type_names() {
            let mapper = SqliteMapper::new(type_name, Arc::clone(&metadata), Rc::clone(&store))?;
            mappers.register(Rc::new(mapper));
        }
        let locks = LockManager::new(store, Rc::clone(&session), clock);
        info!(
            "event=facade_open module=facade status=ok types={} locking={:?}",
            mappers.type_names().len(),
            config.locking
        );
        Ok(Self::new(mappers, locks, session, authorizer, config))
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }

    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Starts a unit of work; earlier tracked handles are dropped.
    pub fn begin(&self) {
        self.transaction.begin();
    }

    /// Persists the unit of work with every write check applied.
    pub fn commit(&self) -> PersistenceResult<()> {
        self.transaction.commit(&CheckedCommit { facade: self })
    }

    pub fn rollback(&self) {
        self.transaction.rollback();
    }

    /// Loads `id` with related entities up to `depth`.
    ///
    /// Returns `None` when the entity does not exist or reading it is not
    /// permitted. In optimistic mode an optimistic lock with the stored
    /// state is taken.
    pub fn load(
        &self,
        id: &EntityId,
        depth: BuildDepth,
        filter: &AttributeFilter,
        type_filter: Option<&[String]>,
    ) -> PersistenceResult<Option<EntityRef>> {
        if !self.is_permitted(&id.to_string(), Action::Read) {
            info!("event=entity_load module=facade status=denied id={id}");
            return Ok(None);
        }
        let Some(LoadedGraph { root, related }) =
            self.mappers.load_graph(id, depth, filter, type_filter)?
        else {
            return Ok(None);
        };
        for entity in related {
            if self.is_permitted(&entity.id().to_string(), Action::Read) {
                self.transaction.register_loaded(entity);
            }
        }

        if self.config.locking == LockingMode::Optimistic {
            let snapshot = if filter_for(filter, id.type_name()).is_some() {
                self.stored_snapshot(id)?
            } else {
                Some(root.state_snapshot())
            };
            self.locks.acquire(id, LockType::Optimistic, snapshot)?;
        }
        Ok(Some(self.transaction.register_loaded(root)))
    }

    /// Creates a new entity of `type_name` with default values.
    ///
    /// For expanding depths one child is created per composite child
    /// relation that requires at least one child.
    pub fn create(
        &self,
        type_name: &str,
        depth: BuildDepth,
        filter: &AttributeFilter,
    ) -> PersistenceResult<EntityRef> {
        let mapper = self.mappers.get(type_name)?;
        let entity = mapper.create(filter_for(filter, type_name))?;
        let parent_id = entity.id().clone();
        let handle = self.transaction.register_new(entity.into_ref());
        debug!("event=entity_create module=facade status=ok id={parent_id}");

        if !depth.expands() {
            return Ok(handle);
        }
        let relations = mapper.metadata()?.child_relations().cloned().collect::<Vec<_>>();
        for relation in relations
            .iter()
            .filter(|relation| relation.is_composite() && relation.other_multiplicity.min >= 1)
        {
            let child = self.create(&relation.other_type, depth.next(), filter)?;
            let child_id = {
                let mut child = borrow_mut(&child)?;
                child.set_reference(&relation.this_role, Some(parent_id.clone()))?;
                child.id().clone()
            };
            let mut parent = borrow_mut(&handle)?;
            let mut children = parent.references(&relation.other_role);
            children.push(child_id);
            parent.load_value(&relation.other_role, Value::References(children));
        }
        Ok(handle)
    }

    /// Validates, authorizes and persists `handle`.
    ///
    /// With an active unit of work the entity is queued instead. Returns
    /// `false` when there was nothing to write.
    ///
    /// # Errors
    /// - `ValidationFailed`, `UnknownField` for invalid values.
    /// - `AuthorizationFailed` for denied create/update.
    /// - `PessimisticLockConflict` / `OptimisticLockConflict`.
    pub fn save(&self, handle: &EntityRef) -> PersistenceResult<bool> {
        let draft = {
            let entity = borrow(handle)?;
            (entity.is_deleted() && entity.id().has_provisional_component())
                .then(|| entity.id().clone())
        };
        if let Some(draft) = draft {
            // Never inserted, so there is nothing to remove.
            self.transaction.detach(&draft);
            debug!("event=entity_save module=facade status=discarded id={draft}");
            return Ok(false);
        }

        let state = {
            let entity = borrow(handle)?;
            validate_entity(&self.metadata, &entity)?;
            self.authorize_write(&entity)?;
            entity.state()
        };
        if state == EntityState::Clean {
            return Ok(false);
        }

        if self.transaction.is_active() {
            match state {
                EntityState::New => self.transaction.register_new(handle.clone()),
                EntityState::Deleted => self.transaction.register_deleted(handle.clone()),
                _ => self.transaction.register_dirty(handle.clone()),
            };
            return Ok(true);
        }

        let mut entity = borrow_mut(handle)?;
        let previous_id = entity.id().clone();
        let written = self.in_storage_transaction(|| {
            if state == EntityState::Deleted {
                self.check_locks(entity.id())?;
                self.mappers.remove(&mut entity)?;
                self.locks.release_locks(entity.id())?;
                return Ok(());
            }
            self.check_locks(entity.id())?;
            self.mappers.persist(&mut entity)?;
            self.refresh_snapshot(entity.id())
        });
        if let Err(err) = written {
            // Storage was rolled back; the handle must not claim a row.
            if entity.id() != &previous_id {
                if let Err(restore_err) = entity.replace_id(previous_id.clone()) {
                    warn!("event=entity_save module=facade status=error id={previous_id} error={restore_err}");
                }
            }
            entity.set_state(state);
            return Err(err);
        }
        let id = entity.id().clone();
        drop(entity);
        if previous_id != id {
            // No observer is subscribed outside a unit of work.
            self.transaction.detach(&previous_id);
            for other in self.transaction.tracked() {
                if let Ok(mut other) = other.try_borrow_mut() {
                    other.replace_reference(&previous_id, &id);
                }
            }
        }
        if state == EntityState::Deleted {
            self.transaction.detach(&id);
        } else {
            self.transaction.attach(handle.clone());
        }
        info!("event=entity_save module=facade status=ok id={id}");
        Ok(true)
    }

    /// Deletes `id`; composite children go first when `recursive`.
    ///
    /// Children that are not deleted lose their foreign key. Returns
    /// `false` when `id` does not exist.
    pub fn delete(&self, id: &EntityId, recursive: bool) -> PersistenceResult<bool> {
        if self.transaction.is_active() {
            return self.delete_graph(id, recursive, false);
        }
        let deleted = self.in_storage_transaction(|| self.delete_graph(id, recursive, true))?;
        if deleted {
            info!("event=entity_delete module=facade status=ok id={id} recursive={recursive}");
        }
        Ok(deleted)
    }

    /// Runs a template or condition query rooted at `type_name`.
    ///
    /// Entities the principal may not read are left out.
    pub fn query(
        &self,
        type_name: &str,
        spec: &QuerySpec,
        depth: BuildDepth,
        order: &[String],
        paging: Option<&mut PagingInfo>,
        filter: &AttributeFilter,
    ) -> PersistenceResult<QueryHits> {
        let statement = spec.statement(type_name, &self.metadata)?;
        let output = run_select(&self.mappers, &statement, depth, order, paging, filter)?;
        match output {
            QueryOutput::Ids(ids) => Ok(QueryHits::Ids(
                ids.into_iter()
                    .filter(|id| self.is_permitted(&id.to_string(), Action::Read))
                    .collect(),
            )),
            QueryOutput::Entities { items, related } => {
                for entity in related {
                    if self.is_permitted(&entity.id().to_string(), Action::Read) {
                        self.transaction.register_loaded(entity);
                    }
                }
                Ok(QueryHits::Entities(
                    items
                        .into_iter()
                        .filter(|entity| self.is_permitted(&entity.id().to_string(), Action::Read))
                        .map(|entity| self.transaction.register_loaded(entity))
                        .collect(),
                ))
            }
        }
    }

    /// Resolves the entities behind `role` of `handle`, loading them on
    /// demand.
    pub fn related(&self, handle: &EntityRef, role: &str) -> PersistenceResult<Vec<EntityRef>> {
        let (id, known) = {
            let entity = borrow(handle)?;
            (entity.id().clone(), entity.has_value(role))
        };
        let relation = self
            .metadata
            .relation(id.type_name(), role)?
            .ok_or_else(|| PersistenceError::UnknownField {
                type_name: id.type_name().to_string(),
                field: role.to_string(),
            })?
            .clone();
        let targets = if relation.is_child() && !known {
            let ids = self.mappers.child_ids(&relation, &id)?;
            borrow_mut(handle)?.load_value(role, Value::References(ids.clone()));
            ids
        } else {
            borrow(handle)?.references(role)
        };

        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(tracked) = self.transaction.get(&target) {
                resolved.push(tracked);
                continue;
            }
            if !self.is_permitted(&target.to_string(), Action::Read) {
                continue;
            }
            let mapper = self.mappers.get(target.type_name())?;
            if let Some(entity) = mapper.load(&target, None)? {
                resolved.push(self.transaction.register_loaded(entity));
            }
        }
        Ok(resolved)
    }

    /// Authorization plus pessimistic lock for interactive editing.
    pub fn acquire_edit_lock(&self, id: &EntityId) -> PersistenceResult<EditAccess> {
        Ok(self
            .locks
            .check_edit_access(id, &self.config.auth_context, self.authorizer.as_ref())?)
    }

    fn delete_graph(&self, id: &EntityId, recursive: bool, immediate: bool) -> PersistenceResult<bool> {
        self.authorize(id.to_string(), Action::Delete)?;
        let Some(handle) = self.tracked_or_loaded(id)? else {
            return Ok(false);
        };
        if immediate {
            self.check_locks(id)?;
        }

        let relations = self
            .metadata
            .type_metadata(id.type_name())?
            .child_relations()
            .cloned()
            .collect::<Vec<_>>();
        for relation in &relations {
            for child_id in self.mappers.child_ids(relation, id)? {
                if recursive && relation.is_composite() {
                    self.delete_graph(&child_id, true, immediate)?;
                    continue;
                }
                let Some(child) = self.tracked_or_loaded(&child_id)? else {
                    continue;
                };
                borrow_mut(&child)?.set_reference(&relation.this_role, None)?;
                if immediate {
                    self.write_checked(&mut *borrow_mut(&child)?)?;
                } else {
                    self.transaction.register_dirty(child);
                }
            }
        }

        if immediate {
            let mut entity = borrow_mut(&handle)?;
            entity.delete();
            self.mappers.remove(&mut entity)?;
            drop(entity);
            self.locks.release_locks(id)?;
            self.transaction.detach(id);
        } else {
            borrow_mut(&handle)?.delete();
            self.transaction.register_deleted(handle);
        }
        debug!("event=entity_delete module=facade status=queued id={id} immediate={immediate}");
        Ok(true)
    }

    /// Validation, authorization and lock checks, then the mapper write.
    fn write_checked(&self, entity: &mut Entity) -> PersistenceResult<()> {
        if entity.state() == EntityState::Clean {
            return Ok(());
        }
        validate_entity(&self.metadata, entity)?;
        self.authorize_write(entity)?;
        self.check_locks(entity.id())?;
        self.mappers.persist(entity)?;
        self.refresh_snapshot(entity.id())
    }

    fn tracked_or_loaded(&self, id: &EntityId) -> PersistenceResult<Option<EntityRef>> {
        if let Some(tracked) = self.transaction.get(id) {
            return Ok(Some(tracked));
        }
        let mapper = self.mappers.get(id.type_name())?;
        Ok(mapper
            .load(id, None)?
            .map(|entity| self.transaction.register_loaded(entity)))
    }

    fn in_storage_transaction<T>(&self, work: impl FnOnce() -> PersistenceResult<T>) -> PersistenceResult<T> {
        self.mappers.begin()?;
        match work() {
            Ok(value) => {
                self.mappers.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.mappers.rollback() {
                    warn!("event=storage_rollback module=facade status=error error={rollback_err}");
                }
                Err(err)
            }
        }
    }

    fn is_permitted(&self, resource: &str, action: Action) -> bool {
        let principal = self.session.current_principal();
        self.authorizer
            .authorize(resource, &self.config.auth_context, action, principal.as_ref())
    }

    fn authorize(&self, resource: String, action: Action) -> PersistenceResult<()> {
        if self.is_permitted(&resource, action) {
            return Ok(());
        }
        warn!("event=authorize module=facade status=denied action={action} resource={resource}");
        Err(PersistenceError::AuthorizationFailed {
            resource,
            action: action.to_string(),
        })
    }

    fn authorize_write(&self, entity: &Entity) -> PersistenceResult<()> {
        match entity.state() {
            EntityState::New => self.authorize(entity.type_name().to_string(), Action::Create),
            EntityState::Dirty => self.authorize(entity.id().to_string(), Action::Update),
            EntityState::Deleted => self.authorize(entity.id().to_string(), Action::Delete),
            EntityState::Clean => Ok(()),
        }
    }

    /// Lock checks for writing `id` under the configured locking mode.
    fn check_locks(&self, id: &EntityId) -> PersistenceResult<()> {
        if id.has_provisional_component() {
            return Ok(());
        }
        match self.config.locking {
            LockingMode::None => Ok(()),
            LockingMode::Pessimistic => {
                let Some(lock) = self.locks.get_lock(id)? else {
                    return Ok(());
                };
                let own = self
                    .session
                    .current_principal()
                    .is_some_and(|principal| lock.is_held_by(&principal.id));
                if own {
                    Ok(())
                } else {
                    Err(PersistenceError::PessimisticLockConflict {
                        object_id: id.clone(),
                        holder_login: lock.holder_login,
                    })
                }
            }
            LockingMode::Optimistic => {
                let Some(snapshot) = self
                    .locks
                    .get_optimistic_lock(id)?
                    .and_then(|lock| lock.snapshot)
                else {
                    return Ok(());
                };
                if self.stored_snapshot(id)?.as_deref() == Some(snapshot.as_str()) {
                    Ok(())
                } else {
                    Err(PersistenceError::OptimisticLockConflict {
                        object_id: id.clone(),
                    })
                }
            }
        }
    }

    fn stored_snapshot(&self, id: &EntityId) -> PersistenceResult<Option<String>> {
        let mapper = self.mappers.get(id.type_name())?;
        Ok(mapper.load(id, None)?.map(|stored| stored.state_snapshot()))
    }

    fn refresh_snapshot(&self, id: &EntityId) -> PersistenceResult<()> {
        if self.config.locking != LockingMode::Optimistic {
            return Ok(());
        }
        if let Some(snapshot) = self.stored_snapshot(id)? {
            self.locks.refresh_snapshot(id, &snapshot)?;
        }
        Ok(())
    }
}

/// Commit target applying the facade's write checks to each queued entity.
struct CheckedCommit<'a> {
    facade: &'a PersistenceFacade,
}

impl CommitTarget for CheckedCommit<'_> {
    fn begin(&self) -> PersistenceResult<()> {
        self.facade.mappers.begin()
    }

    fn commit(&self) -> PersistenceResult<()> {
        self.facade.mappers.commit()
    }

    fn rollback(&self) -> PersistenceResult<()> {
        self.facade.mappers.rollback()
    }

    fn persist(&self, entity: &mut Entity) -> PersistenceResult<()> {
        self.facade.write_checked(entity)
    }

    fn remove(&self, entity: &mut Entity) -> PersistenceResult<()> {
        self.facade
            .authorize(entity.id().to_string(), Action::Delete)?;
        self.facade.check_locks(entity.id())?;
        self.facade.mappers.remove(entity)?;
        self.facade.locks.release_locks(entity.id())?;
        Ok(())
    }
}

fn borrow(handle: &EntityRef) -> PersistenceResult<std::cell::Ref<'_, Entity>> {
    handle
        .try_borrow()
        .map_err(|_| PersistenceError::InvalidData("entity handle is mutably borrowed".to_string()))
}

fn borrow_mut(handle: &EntityRef) -> PersistenceResult<std::cell::RefMut<'_, Entity>> {
    handle
        .try_borrow_mut()
        .map_err(|_| PersistenceError::InvalidData("entity handle is already borrowed".to_string()))
}

//! Per-type persistence: metadata reads, CRUD and relation expansion.
//!
//! # Responsibility
//! - Define the `Mapper` contract used by the facade and the unit of work.
//! - Define the optional `RelationalMapper` capability the query builder
//!   needs to project, hydrate and count rows.
//! - Resolve mappers by type name and expand loaded entities to a build
//!   depth.
//!
//! # Invariants
//! - Mappers depend on type metadata only, never on live entity handles.
//! - To-one relation values are hydrated from the row's foreign key; to-many
//!   values are only filled by graph expansion.
//! - Storage transaction control is re-entrant (see `db::SqliteStore`).

use crate::error::{PersistenceError, PersistenceResult};
use crate::meta::{
    AttributeDescription, MetadataRegistry, OrderSpec, RelationDescription, TagMatch, TypeMetadata,
};
use crate::model::entity::{Entity, ValueProperty};
use crate::model::id::EntityId;
use crate::model::value::Value;
use crate::uow::CommitTarget;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

mod sqlite;
mod validate;

pub use sqlite::SqliteMapper;
pub use validate::validate_entity;

/// Attribute names to load per type; types without an entry load everything.
pub type AttributeFilter = HashMap<String, Vec<String>>;

/// How far related entities are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDepth {
    /// Queries return ids only.
    IdsOnly,
    /// The entity itself; relations stay references.
    Single,
    /// Related entities up to `n` levels.
    Levels(u32),
    /// Every reachable related entity.
    Infinite,
}

impl BuildDepth {
    pub fn expands(self) -> bool {
        match self {
            Self::IdsOnly | Self::Single => false,
            Self::Levels(levels) => levels > 0,
            Self::Infinite => true,
        }
    }

    /// Depth applied to the next relation level.
    pub fn next(self) -> Self {
        match self {
            Self::Levels(levels) if levels > 1 => Self::Levels(levels - 1),
            Self::Infinite => Self::Infinite,
            _ => Self::Single,
        }
    }
}

/// Persistence behaviour for one entity type.
pub trait Mapper {
    fn type_name(&self) -> &str;

    fn registry(&self) -> &MetadataRegistry;

    fn metadata(&self) -> PersistenceResult<&TypeMetadata> {
        Ok(self.registry().type_metadata(self.type_name())?)
    }

    fn pk_names(&self) -> PersistenceResult<&[String]> {
        Ok(self.metadata()?.pk_names())
    }

    fn attributes(&self, tags: &[&str], mode: TagMatch) -> PersistenceResult<Vec<&AttributeDescription>> {
        Ok(self.registry().attributes(self.type_name(), tags, mode)?)
    }

    fn attribute(&self, name: &str) -> PersistenceResult<&AttributeDescription> {
        Ok(self.registry().attribute(self.type_name(), name)?)
    }

    fn relation(&self, role: &str) -> Option<&RelationDescription> {
        self.metadata().ok().and_then(|metadata| metadata.relation(role))
    }

    fn has_relation(&self, role: &str) -> bool {
        self.relation(role).is_some()
    }

    fn has_attribute(&self, name: &str) -> bool {
        self.metadata()
            .map(|metadata| metadata.has_attribute(name))
            .unwrap_or(false)
    }

    /// Default order of this type, or of the children reached via `role`.
    fn default_order(&self, role: Option<&str>) -> PersistenceResult<Vec<OrderSpec>> {
        let metadata = self.metadata()?;
        match role.and_then(|role| metadata.relation(role)) {
            Some(relation) if relation.order.is_some() => Ok(metadata.default_order(role)?),
            Some(relation) => Ok(self
                .registry()
                .type_metadata(&relation.other_type)?
                .default_order(None)?),
            None => Ok(metadata.default_order(None)?),
        }
    }

    /// New entity with a provisional id and default values.
    fn create(&self, filter: Option<&[String]>) -> PersistenceResult<Entity>;

    fn load(&self, id: &EntityId, filter: Option<&[String]>) -> PersistenceResult<Option<Entity>>;

    /// Persists according to state: insert `New`, update `Dirty`, delete
    /// `Deleted`. Successful inserts/updates leave the entity `Clean`.
    fn save(&self, entity: &mut Entity) -> PersistenceResult<()>;

    fn delete(&self, entity: &Entity) -> PersistenceResult<()>;

    /// Ids of this type whose `fk_column` points at `parent_key`.
    fn load_child_ids(
        &self,
        fk_column: &str,
        parent_key: &str,
        order: &[OrderSpec],
    ) -> PersistenceResult<Vec<EntityId>>;

    fn begin_transaction(&self) -> PersistenceResult<()>;

    fn commit_transaction(&self) -> PersistenceResult<()>;

    fn rollback_transaction(&self) -> PersistenceResult<()>;

    /// Capability needed by the query builder.
    fn relational(&self) -> Option<&dyn RelationalMapper> {
        None
    }
}

/// Row-level access for mappers backed by a relational store.
pub trait RelationalMapper {
    fn table_name(&self) -> &str;

    /// Projection expressions for `alias`, in hydration order.
    fn select_columns(&self, alias: &str, filter: Option<&[String]>) -> PersistenceResult<Vec<String>>;

    /// Key column expressions for `alias`, in key order.
    fn key_columns(&self, alias: &str) -> PersistenceResult<Vec<String>>;

    /// Runs `sql` whose leading columns are the key columns.
    fn select_ids(&self, sql: &str) -> PersistenceResult<Vec<EntityId>>;

    /// Runs `sql` projected with `select_columns(_, filter)`.
    fn select_entities(&self, sql: &str, filter: Option<&[String]>) -> PersistenceResult<Vec<Entity>>;

    /// Runs a single-value `COUNT` statement.
    fn count(&self, sql: &str) -> PersistenceResult<u64>;
}

/// Copies attribute metadata into per-value properties.
pub(crate) fn apply_value_properties(entity: &mut Entity, attribute: &AttributeDescription) {
    let name = attribute.name.as_str();
    entity.set_value_property(name, ValueProperty::Editable, attribute.editable.to_string());
    if let Some(pattern) = &attribute.restrictions_match {
        entity.set_value_property(name, ValueProperty::RestrictionsMatch, pattern.as_str());
    }
    if let Some(pattern) = &attribute.restrictions_not_match {
        entity.set_value_property(name, ValueProperty::RestrictionsNotMatch, pattern.as_str());
    }
    if let Some(description) = &attribute.restrictions_description {
        entity.set_value_property(name, ValueProperty::RestrictionsDescription, description.clone());
    }
    if let Some(input_type) = &attribute.input_type {
        entity.set_value_property(name, ValueProperty::InputType, input_type.clone());
    }
    if let Some(display_type) = &attribute.display_type {
        entity.set_value_property(name, ValueProperty::DisplayType, display_type.clone());
    }
}

/// Entities produced by one graph load.
#[derive(Debug)]
pub struct LoadedGraph {
    pub root: Entity,
    pub related: Vec<Entity>,
}

/// Mapper lookup by type name.
pub struct MapperRegistry {
    metadata: Arc<MetadataRegistry>,
    mappers: HashMap<String, Rc<dyn Mapper>>,
}

impl MapperRegistry {
    pub fn new(metadata: Arc<MetadataRegistry>) -> Self {
        Self {
            metadata,
            mappers: HashMap::new(),
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn register(&mut self, mapper: Rc<dyn Mapper>) {
        self.mappers.insert(mapper.type_name().to_string(), mapper);
    }

    pub fn get(&self, type_name: &str) -> PersistenceResult<Rc<dyn Mapper>> {
        self.mappers
            .get(type_name)
            .cloned()
            .ok_or_else(|| PersistenceError::UnknownType(type_name.to_string()))
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names = self.mappers.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// Loads `id` and expands its relations to `depth`.
    ///
    /// Relations to types outside `type_filter` (when given) are not
    /// followed. Every entity is loaded at most once per call.
    pub fn load_graph(
        &self,
        id: &EntityId,
        depth: BuildDepth,
        filter: &AttributeFilter,
        type_filter: Option<&[String]>,
    ) -> PersistenceResult<Option<LoadedGraph>> {
        let mapper = self.get(id.type_name())?;
        let Some(mut root) = mapper.load(id, filter_for(filter, id.type_name()))? else {
            return Ok(None);
        };
        let mut related = Vec::new();
        let mut visited = HashSet::from([id.to_string()]);
        self.expand(&mut root, depth, filter, type_filter, &mut visited, &mut related)?;
        debug!(
            "event=graph_load module=mapper status=ok id={} related={}",
            id,
            related.len()
        );
        Ok(Some(LoadedGraph { root, related }))
    }

    /// Fills relation values of `entity` and loads related entities.
    pub fn expand(
        &self,
        entity: &mut Entity,
        depth: BuildDepth,
        filter: &AttributeFilter,
        type_filter: Option<&[String]>,
        visited: &mut HashSet<String>,
        related: &mut Vec<Entity>,
    ) -> PersistenceResult<()> {
        if !depth.expands() {
            return Ok(());
        }
        let relations = self
            .metadata
            .type_metadata(entity.type_name())?
            .relations()
            .to_vec();
        for relation in relations {
            if type_filter.is_some_and(|types| !types.contains(&relation.other_type)) {
                continue;
            }
            let targets = if relation.is_parent() {
                entity.references(&relation.other_role)
            } else {
                let ids = self.child_ids(&relation, entity.id())?;
                entity.load_value(&relation.other_role, Value::References(ids.clone()));
                ids
            };
            for target in targets {
                if target.has_provisional_component() || !visited.insert(target.to_string()) {
                    continue;
                }
                let mapper = self.get(target.type_name())?;
                let Some(mut loaded) = mapper.load(&target, filter_for(filter, target.type_name()))?
                else {
                    continue;
                };
                self.expand(&mut loaded, depth.next(), filter, type_filter, visited, related)?;
                related.push(loaded);
            }
        }
        Ok(())
    }

    /// Child ids reached from `parent` through a child relation.
    pub fn child_ids(
        &self,
        relation: &RelationDescription,
        parent: &EntityId,
    ) -> PersistenceResult<Vec<EntityId>> {
        if parent.has_provisional_component() {
            return Ok(Vec::new());
        }
        let Some(parent_key) = parent.components().first() else {
            return Ok(Vec::new());
        };
        let order = self
            .get(&relation.this_type)?
            .default_order(Some(&relation.other_role))?;
        self.get(&relation.other_type)?
            .load_child_ids(&relation.fk_column, parent_key, &order)
    }

    fn each_mapper(
        &self,
        action: impl Fn(&dyn Mapper) -> PersistenceResult<()>,
    ) -> PersistenceResult<()> {
        let mut first_error = None;
        for name in self.type_names() {
            if let Some(mapper) = self.mappers.get(name) {
                if let Err(err) = action(mapper.as_ref()) {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl CommitTarget for MapperRegistry {
    fn begin(&self) -> PersistenceResult<()> {
        self.each_mapper(|mapper| mapper.begin_transaction())
    }

    fn commit(&self) -> PersistenceResult<()> {
        self.each_mapper(|mapper| mapper.commit_transaction())
    }

    fn rollback(&self) -> PersistenceResult<()> {
        self.each_mapper(|mapper| mapper.rollback_transaction())
    }

    fn persist(&self, entity: &mut Entity) -> PersistenceResult<()> {
        self.get(entity.type_name())?.save(entity)
    }

    fn remove(&self, entity: &mut Entity) -> PersistenceResult<()> {
        self.get(entity.type_name())?.delete(entity)
    }
}

/// Attribute names to load for `type_name`.
pub fn filter_for<'a>(filter: &'a AttributeFilter, type_name: &str) -> Option<&'a [String]> {
    filter.get(type_name).map(Vec::as_slice)
}

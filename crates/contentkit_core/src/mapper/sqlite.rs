//! SQLite-backed mapper.
//!
//! # Invariants
//! - Projection order is derived from metadata only, so `select_columns`
//!   and row hydration always agree for the same filter.
//! - Updates write only values present on the entity.
//! - References to provisional ids are written as NULL foreign keys.

use crate::db::SqliteStore;
use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::{apply_value_properties, Mapper, RelationalMapper};
use crate::meta::{MetadataRegistry, OrderSpec, TypeMetadata, ValueType};
use crate::model::entity::{Entity, EntityState};
use crate::model::id::EntityId;
use crate::model::value::Value;
use log::debug;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Row};
use std::rc::Rc;
use std::sync::Arc;

/// One projected column.
#[derive(Debug, Clone)]
enum Column {
    Key {
        index: usize,
        column: String,
    },
    Attribute {
        name: String,
        column: String,
        value_type: ValueType,
    },
    /// Attribute aliasing a parent's attribute through a foreign key.
    Reference {
        name: String,
        value_type: ValueType,
        fk_column: String,
        parent_table: String,
        parent_key: String,
        parent_column: String,
    },
    ParentFk {
        role: String,
        parent_type: String,
        fk_column: String,
    },
}

impl Column {
    fn projection(&self, alias: &str) -> String {
        match self {
            Self::Key { column, .. } | Self::Attribute { column, .. } => format!("{alias}.{column}"),
            Self::ParentFk { fk_column, .. } => format!("{alias}.{fk_column}"),
            Self::Reference {
                fk_column,
                parent_table,
                parent_key,
                parent_column,
                ..
            } => format!(
                "(SELECT r_{fk_column}.{parent_column} FROM {parent_table} AS r_{fk_column} \
                 WHERE r_{fk_column}.{parent_key} = {alias}.{fk_column})"
            ),
        }
    }
}

pub struct SqliteMapper {
    type_name: String,
    registry: Arc<MetadataRegistry>,
    store: Rc<SqliteStore>,
}

impl SqliteMapper {
    pub fn new(
        type_name: impl Into<String>,
        registry: Arc<MetadataRegistry>,
        store: Rc<SqliteStore>,
    ) -> PersistenceResult<Self> {
        let type_name = type_name.into();
        registry.type_metadata(&type_name)?;
        Ok(Self {
            type_name,
            registry,
            store,
        })
    }

    fn type_metadata(&self) -> PersistenceResult<&TypeMetadata> {
        Ok(self.registry.type_metadata(&self.type_name)?)
    }

    fn plan(&self, filter: Option<&[String]>) -> PersistenceResult<Vec<Column>> {
        let metadata = self.type_metadata()?;
        let wanted = |name: &str| filter.map_or(true, |names| names.iter().any(|n| n == name));
        let mut plan = Vec::new();

        for (index, pk) in metadata.pk_names().iter().enumerate() {
            let column = metadata
                .column_for(pk)
                .ok_or_else(|| PersistenceError::UnknownField {
                    type_name: self.type_name.clone(),
                    field: pk.clone(),
                })?;
            plan.push(Column::Key {
                index,
                column: column.to_string(),
            });
        }

        for attribute in metadata.attributes() {
            if attribute.is_primary_key || !wanted(&attribute.name) {
                continue;
            }
            if let Some(column) = &attribute.column {
                plan.push(Column::Attribute {
                    name: attribute.name.clone(),
                    column: column.clone(),
                    value_type: attribute.value_type,
                });
                continue;
            }
            let Some(reference) = &attribute.reference else {
                continue;
            };
            let Some(relation) = metadata
                .parent_relations()
                .find(|relation| relation.other_type == reference.type_name)
            else {
                continue;
            };
            let parent = self.registry.type_metadata(&reference.type_name)?;
            let parent_keys = parent.pk_columns();
            let (Some(parent_column), [parent_key]) =
                (parent.column_for(&reference.attribute), parent_keys.as_slice())
            else {
                continue;
            };
            let resolved = self.registry.attribute(&self.type_name, &attribute.name)?;
            plan.push(Column::Reference {
                name: attribute.name.clone(),
                value_type: resolved.value_type,
                fk_column: relation.fk_column.clone(),
                parent_table: parent.table().to_string(),
                parent_key: (*parent_key).to_string(),
                parent_column: parent_column.to_string(),
            });
        }

        for relation in metadata.parent_relations() {
            plan.push(Column::ParentFk {
                role: relation.other_role.clone(),
                parent_type: relation.other_type.clone(),
                fk_column: relation.fk_column.clone(),
            });
        }
        Ok(plan)
    }

    fn hydrate(&self, row: &Row<'_>, plan: &[Column]) -> PersistenceResult<Entity> {
        let metadata = self.type_metadata()?;
        let mut components = vec![String::new(); metadata.pk_names().len()];
        let mut values = Vec::with_capacity(plan.len());

        for (position, column) in plan.iter().enumerate() {
            let raw: SqlValue = row.get(position)?;
            match column {
                Column::Key { index, .. } => {
                    components[*index] = key_text(&raw).ok_or_else(|| {
                        PersistenceError::InvalidData(format!(
                            "{} row with unusable key value",
                            self.type_name
                        ))
                    })?;
                }
                Column::Attribute {
                    name, value_type, ..
                }
                | Column::Reference {
                    name, value_type, ..
                } => values.push((name.clone(), from_sql(raw, *value_type)?)),
                Column::ParentFk {
                    role, parent_type, ..
                } => {
                    let value = match key_text(&raw) {
                        Some(key) => Value::Reference(EntityId::new(parent_type.clone(), [key])?),
                        None => Value::Null,
                    };
                    values.push((role.clone(), value));
                }
            }
        }

        let id = EntityId::new(self.type_name.clone(), components)?;
        let mut entity = Entity::new(id, metadata.pk_names().to_vec(), EntityState::Clean);
        for (name, value) in values {
            entity.load_value(&name, value);
        }
        self.apply_properties(&mut entity)?;
        Ok(entity)
    }

    fn apply_properties(&self, entity: &mut Entity) -> PersistenceResult<()> {
        let names = entity
            .value_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        for name in names {
            if let Ok(attribute) = self.registry.attribute(&self.type_name, &name) {
                apply_value_properties(entity, attribute);
            }
        }
        Ok(())
    }

    /// Column/value pairs for every present, writable value.
    fn write_set(&self, entity: &Entity) -> PersistenceResult<Vec<(String, SqlValue)>> {
        let metadata = self.type_metadata()?;
        let mut set = Vec::new();
        for attribute in metadata.attributes() {
            if attribute.is_primary_key {
                continue;
            }
            let (Some(column), Some(value)) = (&attribute.column, entity.value(&attribute.name))
            else {
                continue;
            };
            set.push((column.clone(), to_sql(value)));
        }
        for relation in metadata.parent_relations() {
            if let Some(value) = entity.value(&relation.other_role) {
                set.push((relation.fk_column.clone(), to_sql(value)));
            }
        }
        Ok(set)
    }

    fn key_condition(&self, id: &EntityId, first_param: usize) -> PersistenceResult<(String, Vec<SqlValue>)> {
        let metadata = self.type_metadata()?;
        let columns = metadata.pk_columns();
        if columns.len() != id.components().len() || id.type_name() != self.type_name {
            return Err(PersistenceError::InvalidIdentity(
                crate::model::id::IdError::ArityMismatch {
                    type_name: id.type_name().to_string(),
                    expected: columns.len(),
                    actual: id.components().len(),
                },
            ));
        }
        let condition = columns
            .iter()
            .enumerate()
            .map(|(offset, column)| format!("{column} = ?{}", first_param + offset))
            .collect::<Vec<_>>()
            .join(" AND ");
        let params = id
            .components()
            .iter()
            .map(|component| key_to_sql(component))
            .collect();
        Ok((condition, params))
    }

    fn insert(&self, entity: &mut Entity) -> PersistenceResult<()> {
        let metadata = self.type_metadata()?;
        let table = metadata.table();
        let mut columns = Vec::new();
        let mut params = Vec::new();
        let mut assign_rowid = false;

        if entity.id().has_provisional_component() {
            let single_integer = matches!(metadata.pk_names(), [pk] if metadata
                .attribute(pk)
                .is_some_and(|attribute| attribute.value_type == ValueType::Integer));
            if !single_integer {
                return Err(PersistenceError::InvalidData(format!(
                    "key of {} must be assigned before insert",
                    entity.id()
                )));
            }
            assign_rowid = true;
        } else {
            for (column, component) in metadata.pk_columns().iter().zip(entity.id().components()) {
                columns.push((*column).to_string());
                params.push(key_to_sql(component));
            }
        }
        for (column, value) in self.write_set(entity)? {
            columns.push(column);
            params.push(value);
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES;")
        } else {
            let placeholders = (1..=columns.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders});",
                columns.join(", ")
            )
        };
        let conn = self.store.connection();
        conn.execute(&sql, params_from_iter(params))?;

        if assign_rowid {
            let key = conn.last_insert_rowid().to_string();
            let real_id = entity.id().with_component(0, key)?;
            entity.replace_id(real_id)?;
        }
        debug!(
            "event=entity_insert module=mapper status=ok type={} id={}",
            self.type_name,
            entity.id()
        );
        entity.mark_clean();
        Ok(())
    }

    fn update(&self, entity: &mut Entity) -> PersistenceResult<()> {
        let set = self.write_set(entity)?;
        if set.is_empty() {
            entity.mark_clean();
            return Ok(());
        }
        let table = self.type_metadata()?.table();
        let assignments = set
            .iter()
            .enumerate()
            .map(|(index, (column, _))| format!("{column} = ?{}", index + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let (condition, key_params) = self.key_condition(entity.id(), set.len() + 1)?;
        let params = set
            .into_iter()
            .map(|(_, value)| value)
            .chain(key_params)
            .collect::<Vec<_>>();

        let changed = self.store.connection().execute(
            &format!("UPDATE {table} SET {assignments} WHERE {condition};"),
            params_from_iter(params),
        )?;
        if changed == 0 {
            return Err(PersistenceError::NotFound(entity.id().clone()));
        }
        debug!(
            "event=entity_update module=mapper status=ok type={} id={}",
            self.type_name,
            entity.id()
        );
        entity.mark_clean();
        Ok(())
    }
}

impl Mapper for SqliteMapper {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    fn create(&self, filter: Option<&[String]>) -> PersistenceResult<Entity> {
        let metadata = self.type_metadata()?;
        let id = EntityId::new_provisional(&self.type_name, self.registry.as_ref())?;
        let mut entity = Entity::new(id, metadata.pk_names().to_vec(), EntityState::New);
        for attribute in metadata.attributes() {
            if attribute.is_primary_key {
                continue;
            }
            if filter.is_some_and(|names| !names.contains(&attribute.name)) {
                continue;
            }
            let resolved = self.registry.attribute(&self.type_name, &attribute.name)?;
            entity.load_value(
                &attribute.name,
                resolved.default_value.clone().unwrap_or(Value::Null),
            );
            apply_value_properties(&mut entity, resolved);
        }
        for relation in metadata.parent_relations() {
            entity.load_value(&relation.other_role, Value::Null);
        }
        Ok(entity)
    }

    fn load(&self, id: &EntityId, filter: Option<&[String]>) -> PersistenceResult<Option<Entity>> {
        if id.has_provisional_component() {
            return Ok(None);
        }
        let plan = self.plan(filter)?;
        let table = self.type_metadata()?.table().to_string();
        let projection = plan
            .iter()
            .map(|column| column.projection(&table))
            .collect::<Vec<_>>()
            .join(", ");
        let (condition, params) = self.key_condition(id, 1)?;
        let sql = format!("SELECT {projection} FROM {table} WHERE {condition};");

        let conn = self.store.connection();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        match rows.next()? {
            Some(row) => Ok(Some(self.hydrate(row, &plan)?)),
            None => Ok(None),
        }
    }

    fn save(&self, entity: &mut Entity) -> PersistenceResult<()> {
        match entity.state() {
            EntityState::New => self.insert(entity),
            EntityState::Dirty => self.update(entity),
            EntityState::Deleted => self.delete(entity),
            EntityState::Clean => Ok(()),
        }
    }

    fn delete(&self, entity: &Entity) -> PersistenceResult<()> {
        if entity.id().has_provisional_component() {
            return Ok(());
        }
        let table = self.type_metadata()?.table();
        let (condition, params) = self.key_condition(entity.id(), 1)?;
        let removed = self.store.connection().execute(
            &format!("DELETE FROM {table} WHERE {condition};"),
            params_from_iter(params),
        )?;
        debug!(
            "event=entity_delete module=mapper status=ok type={} id={} rows={}",
            self.type_name,
            entity.id(),
            removed
        );
        Ok(())
    }

    fn load_child_ids(
        &self,
        fk_column: &str,
        parent_key: &str,
        order: &[OrderSpec],
    ) -> PersistenceResult<Vec<EntityId>> {
        let metadata = self.type_metadata()?;
        let table = metadata.table();
        let keys = metadata.pk_columns().join(", ");
        let order_by = order
            .iter()
            .filter_map(|spec| {
                metadata
                    .column_for(&spec.field)
                    .map(|column| format!("{column} {}", spec.direction.as_sql()))
            })
            .collect::<Vec<_>>();
        let mut sql = format!("SELECT {keys} FROM {table} WHERE {fk_column} = ?1");
        if !order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_by.join(", ")));
        }
        sql.push(';');

        let conn = self.store.connection();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([key_to_sql(parent_key)])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(self.row_id(row)?);
        }
        Ok(ids)
    }

    fn begin_transaction(&self) -> PersistenceResult<()> {
        self.store.begin()?;
        Ok(())
    }

    fn commit_transaction(&self) -> PersistenceResult<()> {
        Ok(self.store.commit()?)
    }

    fn rollback_transaction(&self) -> PersistenceResult<()> {
        Ok(self.store.rollback()?)
    }

    fn relational(&self) -> Option<&dyn RelationalMapper> {
        Some(self)
    }
}

impl SqliteMapper {
    fn row_id(&self, row: &Row<'_>) -> PersistenceResult<EntityId> {
        let count = self.type_metadata()?.pk_names().len();
        let mut components = Vec::with_capacity(count);
        for index in 0..count {
            let raw: SqlValue = row.get(index)?;
            components.push(key_text(&raw).ok_or_else(|| {
                PersistenceError::InvalidData(format!("{} row without key", self.type_name))
            })?);
        }
        Ok(EntityId::new(self.type_name.clone(), components)?)
    }
}

impl RelationalMapper for SqliteMapper {
    fn table_name(&self) -> &str {
        self.type_metadata().map_or("", TypeMetadata::table)
    }

    fn select_columns(&self, alias: &str, filter: Option<&[String]>) -> PersistenceResult<Vec<String>> {
        Ok(self
            .plan(filter)?
            .iter()
            .map(|column| column.projection(alias))
            .collect())
    }

    fn key_columns(&self, alias: &str) -> PersistenceResult<Vec<String>> {
        Ok(self
            .type_metadata()?
            .pk_columns()
            .iter()
            .map(|column| format!("{alias}.{column}"))
            .collect())
    }

    fn select_ids(&self, sql: &str) -> PersistenceResult<Vec<EntityId>> {
        let conn = self.store.connection();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(self.row_id(row)?);
        }
        Ok(ids)
    }

    fn select_entities(&self, sql: &str, filter: Option<&[String]>) -> PersistenceResult<Vec<Entity>> {
        let plan = self.plan(filter)?;
        let conn = self.store.connection();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(self.hydrate(row, &plan)?);
        }
        Ok(entities)
    }

    fn count(&self, sql: &str) -> PersistenceResult<u64> {
        let count: i64 = self
            .store
            .connection()
            .query_row(sql, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn key_text(raw: &SqlValue) -> Option<String> {
    match raw {
        SqlValue::Integer(value) => Some(value.to_string()),
        SqlValue::Text(value) if !value.is_empty() => Some(value.clone()),
        SqlValue::Real(value) => Some(value.to_string()),
        _ => None,
    }
}

fn key_to_sql(component: &str) -> SqlValue {
    component
        .parse::<i64>()
        .map_or_else(|_| SqlValue::Text(component.to_string()), SqlValue::Integer)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null | Value::References(_) => SqlValue::Null,
        Value::Integer(value) => SqlValue::Integer(*value),
        Value::Real(value) => SqlValue::Real(*value),
        Value::Boolean(value) => SqlValue::Integer(i64::from(*value)),
        Value::Text(value) => SqlValue::Text(value.clone()),
        Value::Reference(id) if id.has_provisional_component() => SqlValue::Null,
        Value::Reference(id) => id
            .components()
            .first()
            .map_or(SqlValue::Null, |component| key_to_sql(component)),
    }
}

fn from_sql(raw: SqlValue, value_type: ValueType) -> PersistenceResult<Value> {
    let value = match (raw, value_type) {
        (SqlValue::Null, _) => Value::Null,
        (SqlValue::Integer(value), ValueType::Boolean) => Value::Boolean(value != 0),
        (SqlValue::Integer(value), ValueType::Real) => Value::Real(value as f64),
        (SqlValue::Integer(value), ValueType::Integer) => Value::Integer(value),
        (SqlValue::Integer(value), _) => Value::Text(value.to_string()),
        (SqlValue::Real(value), ValueType::Integer | ValueType::Real) => Value::Real(value),
        (SqlValue::Real(value), _) => Value::Text(value.to_string()),
        (SqlValue::Text(value), ValueType::Integer) => value
            .parse::<i64>()
            .map_or(Value::Text(value.clone()), Value::Integer),
        (SqlValue::Text(value), _) => Value::Text(value),
        (SqlValue::Blob(_), _) => {
            return Err(PersistenceError::InvalidData(
                "binary column values are not supported".to_string(),
            ))
        }
    };
    Ok(value)
}

//! Metadata registry: load, validate and query type metadata.

use crate::meta::attribute::{AttributeConfig, AttributeDescription, TagMatch};
use crate::meta::relation::{Hierarchy, RelationConfig, RelationDescription};
use crate::meta::{MetadataError, MetadataResult};
use crate::model::id::KeyCatalog;
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::path::Path;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid sql identifier regex")
});

/// Root of the metadata JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataConfig {
    pub types: Vec<TypeConfig>,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
}

/// One entity type as declared in metadata JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeConfig {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    pub pk: Vec<String>,
    pub attributes: Vec<AttributeConfig>,
    #[serde(default)]
    pub default_order: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// `{type, field, direction}` ordering entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    pub type_name: String,
    pub field: String,
    pub direction: SortDirection,
}

impl OrderSpec {
    /// Parses `field [ASC|DESC]` for `type_name`.
    pub fn parse(type_name: &str, value: &str) -> MetadataResult<Self> {
        let mut parts = value.split_whitespace();
        let field = parts
            .next()
            .ok_or_else(|| MetadataError::InvalidConfig(format!("empty order for `{type_name}`")))?;
        let direction = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => SortDirection::Asc,
            Some("DESC") => SortDirection::Desc,
            Some(other) => {
                return Err(MetadataError::InvalidConfig(format!(
                    "invalid sort direction `{other}` in `{value}`"
                )))
            }
        };
        if parts.next().is_some() {
            return Err(MetadataError::InvalidConfig(format!(
                "invalid order specification `{value}`"
            )));
        }
        Ok(Self {
            type_name: type_name.to_string(),
            field: field.to_string(),
            direction,
        })
    }
}

impl Display for OrderSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.direction.as_sql())
    }
}

/// Validated metadata of one entity type.
#[derive(Debug, Clone)]
pub struct TypeMetadata {
    name: String,
    table: String,
    pk_names: Vec<String>,
    attributes: Vec<AttributeDescription>,
    relations: Vec<RelationDescription>,
    default_order: Vec<OrderSpec>,
}

impl TypeMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pk_names(&self) -> &[String] {
        &self.pk_names
    }

    pub fn is_pk(&self, name: &str) -> bool {
        self.pk_names.iter().any(|pk| pk == name)
    }

    /// Declared attributes in declaration order (reference aliases unresolved).
    pub fn attributes(&self) -> &[AttributeDescription] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|attribute| attribute.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    /// Navigable relations of this type.
    pub fn relations(&self) -> &[RelationDescription] {
        &self.relations
    }

    /// Relation reached through `role` (the other end's role name).
    pub fn relation(&self, role: &str) -> Option<&RelationDescription> {
        self.relations
            .iter()
            .find(|relation| relation.other_role == role)
    }

    pub fn has_relation(&self, role: &str) -> bool {
        self.relation(role).is_some()
    }

    /// First navigable relation to `other_type`.
    pub fn relation_to(&self, other_type: &str) -> Option<&RelationDescription> {
        self.relations
            .iter()
            .find(|relation| relation.other_type == other_type)
    }

    pub fn parent_relations(&self) -> impl Iterator<Item = &RelationDescription> {
        self.relations.iter().filter(|relation| relation.is_parent())
    }

    pub fn child_relations(&self) -> impl Iterator<Item = &RelationDescription> {
        self.relations.iter().filter(|relation| relation.is_child())
    }

    /// Default order for the type, or the declared order of the relation
    /// reached via `role`. Roles without a declared order yield the type's
    /// own order.
    pub fn default_order(&self, role: Option<&str>) -> MetadataResult<Vec<OrderSpec>> {
        if let Some(relation) = role.and_then(|role| self.relation(role)) {
            if let Some(order) = &relation.order {
                return Ok(vec![OrderSpec::parse(&relation.other_type, order)?]);
            }
        }
        Ok(self.default_order.clone())
    }

    /// Column for an attribute; `None` for unmapped or unknown names.
    pub fn column_for(&self, name: &str) -> Option<&str> {
        self.attribute(name)
            .and_then(|attribute| attribute.column.as_deref())
    }

    /// Key columns in key order.
    pub fn pk_columns(&self) -> Vec<&str> {
        self.pk_names
            .iter()
            .filter_map(|name| self.column_for(name))
            .collect()
    }
}

/// Immutable store of every type's metadata.
#[derive(Debug, Clone)]
pub struct MetadataRegistry {
    types: BTreeMap<String, TypeMetadata>,
}

impl MetadataRegistry {
    /// Validates `config` and builds the registry.
    pub fn from_config(config: MetadataConfig) -> MetadataResult<Self> {
        let mut types = BTreeMap::new();
        for type_config in &config.types {
            let metadata = build_type(type_config)?;
            if types.insert(metadata.name.clone(), metadata).is_some() {
                return Err(MetadataError::InvalidConfig(format!(
                    "type `{}` is declared twice",
                    type_config.name
                )));
            }
        }

        for relation in &config.relations {
            check_identifier(&relation.fk_column)?;
            for end in &relation.ends {
                if !types.contains_key(&end.type_name) {
                    return Err(MetadataError::UnknownType(end.type_name.clone()));
                }
            }
            let parent_type = &relation.ends[relation.parent_index()?].type_name;
            let parent_keys = types
                .get(parent_type)
                .map_or(0, |metadata| metadata.pk_names.len());
            if parent_keys != 1 {
                return Err(MetadataError::InvalidConfig(format!(
                    "parent type `{parent_type}` of relation via `{}` needs a single key",
                    relation.fk_column
                )));
            }
            for description in relation.describe()? {
                let owner = types
                    .get_mut(&description.this_type)
                    .ok_or_else(|| MetadataError::UnknownType(description.this_type.clone()))?;
                if owner.has_relation(&description.other_role)
                    || owner.has_attribute(&description.other_role)
                {
                    return Err(MetadataError::InvalidConfig(format!(
                        "role `{}` collides on type `{}`",
                        description.other_role, owner.name
                    )));
                }
                if description.is_parent()
                    && owner
                        .attributes
                        .iter()
                        .any(|attribute| attribute.column.as_deref() == Some(description.fk_column.as_str()))
                {
                    return Err(MetadataError::InvalidConfig(format!(
                        "foreign key column `{}` collides with an attribute of `{}`",
                        description.fk_column, owner.name
                    )));
                }
                owner.relations.push(description);
            }
        }

        let registry = Self { types };
        registry.check_cross_references(&config)?;
        info!(
            "event=metadata_load module=meta status=ok types={} relations={}",
            registry.types.len(),
            config.relations.len()
        );
        Ok(registry)
    }

    pub fn from_json_str(json: &str) -> MetadataResult<Self> {
        let config: MetadataConfig = serde_json::from_str(json)?;
        Self::from_config(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn type_metadata(&self, type_name: &str) -> MetadataResult<&TypeMetadata> {
        self.types
            .get(type_name)
            .ok_or_else(|| MetadataError::UnknownType(type_name.to_string()))
    }

    /// Attribute description; reference aliases are resolved on first
    /// access and the resolved descriptor is reused afterwards.
    pub fn attribute(&self, type_name: &str, name: &str) -> MetadataResult<&AttributeDescription> {
        let raw = self
            .type_metadata(type_name)?
            .attribute(name)
            .ok_or_else(|| MetadataError::UnknownAttribute {
                type_name: type_name.to_string(),
                name: name.to_string(),
            })?;
        self.resolve(raw)
    }

    /// Attributes whose tags relate to `tags` as demanded by `mode`.
    pub fn attributes(
        &self,
        type_name: &str,
        tags: &[&str],
        mode: TagMatch,
    ) -> MetadataResult<Vec<&AttributeDescription>> {
        let requested = tags
            .iter()
            .map(|tag| tag.to_string())
            .collect::<BTreeSet<_>>();
        let mut result = Vec::new();
        for raw in self.type_metadata(type_name)?.attributes() {
            let attribute = self.resolve(raw)?;
            if mode.matches(&requested, &attribute.tags) {
                result.push(attribute);
            }
        }
        Ok(result)
    }

    pub fn relation(&self, type_name: &str, role: &str) -> MetadataResult<Option<&RelationDescription>> {
        Ok(self.type_metadata(type_name)?.relation(role))
    }

    /// Relations leading from `from` up to its ancestor `to`.
    pub fn ancestor_path(&self, from: &str, to: &str) -> Option<Vec<&RelationDescription>> {
        self.search_path(from, to, Hierarchy::Parent)
    }

    /// Relations leading from `from` down to its descendant `to`.
    pub fn descendant_path(&self, from: &str, to: &str) -> Option<Vec<&RelationDescription>> {
        self.search_path(from, to, Hierarchy::Child)
    }

    /// Ancestor path, else descendant path; empty for `from == to`.
    pub fn connection_path(&self, from: &str, to: &str) -> Option<Vec<&RelationDescription>> {
        self.ancestor_path(from, to)
            .or_else(|| self.descendant_path(from, to))
    }

    fn resolve<'a>(&'a self, raw: &'a AttributeDescription) -> MetadataResult<&'a AttributeDescription> {
        let Some(reference) = &raw.reference else {
            return Ok(raw);
        };
        if let Some(resolved) = raw.resolved.get() {
            return Ok(&**resolved);
        }
        let target = self
            .type_metadata(&reference.type_name)?
            .attribute(&reference.attribute)
            .ok_or_else(|| MetadataError::UnknownAttribute {
                type_name: reference.type_name.clone(),
                name: reference.attribute.clone(),
            })?;
        let resolved = raw
            .resolved
            .get_or_init(|| Box::new(raw.resolved_from(target)));
        Ok(&**resolved)
    }

    fn search_path(
        &self,
        from: &str,
        to: &str,
        direction: Hierarchy,
    ) -> Option<Vec<&RelationDescription>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut visited = HashSet::from([from.to_string()]);
        let mut previous: HashMap<String, &RelationDescription> = HashMap::new();
        let mut queue = VecDeque::from([from.to_string()]);

        while let Some(current) = queue.pop_front() {
            let Some(metadata) = self.types.get(&current) else {
                continue;
            };
            for relation in metadata
                .relations
                .iter()
                .filter(|relation| relation.hierarchy == direction)
            {
                if !visited.insert(relation.other_type.clone()) {
                    continue;
                }
                previous.insert(relation.other_type.clone(), relation);
                if relation.other_type == to {
                    let mut path = Vec::new();
                    let mut cursor = to.to_string();
                    while let Some(step) = previous.get(&cursor) {
                        path.push(*step);
                        cursor = step.this_type.clone();
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(relation.other_type.clone());
            }
        }
        None
    }

    fn check_cross_references(&self, config: &MetadataConfig) -> MetadataResult<()> {
        for metadata in self.types.values() {
            for attribute in &metadata.attributes {
                if let Some(reference) = &attribute.reference {
                    let target = self.type_metadata(&reference.type_name)?;
                    let referenced = target.attribute(&reference.attribute).ok_or_else(|| {
                        MetadataError::UnknownAttribute {
                            type_name: reference.type_name.clone(),
                            name: reference.attribute.clone(),
                        }
                    })?;
                    if referenced.is_reference() {
                        return Err(MetadataError::InvalidConfig(format!(
                            "`{}.{}` references another reference attribute",
                            metadata.name, attribute.name
                        )));
                    }
                }
            }
        }
        for relation in &config.relations {
            if let Some(order) = &relation.order {
                let child = &relation.ends[1 - relation.parent_index()?].type_name;
                let spec = OrderSpec::parse(child, order)?;
                if !self.type_metadata(child)?.has_attribute(&spec.field) {
                    return Err(MetadataError::UnknownAttribute {
                        type_name: child.clone(),
                        name: spec.field,
                    });
                }
            }
        }
        Ok(())
    }
}

impl KeyCatalog for MetadataRegistry {
    fn key_count(&self, type_name: &str) -> Option<usize> {
        self.types
            .get(type_name)
            .map(|metadata| metadata.pk_names.len())
    }
}

fn build_type(config: &TypeConfig) -> MetadataResult<TypeMetadata> {
    if config.name.is_empty() || config.name.contains(':') {
        return Err(MetadataError::InvalidConfig(format!(
            "invalid type name `{}`",
            config.name
        )));
    }
    let table = config.table.clone().unwrap_or_else(|| config.name.clone());
    check_identifier(&table)?;
    if config.pk.is_empty() {
        return Err(MetadataError::InvalidConfig(format!(
            "type `{}` declares no key",
            config.name
        )));
    }

    let mut attributes: Vec<AttributeDescription> = Vec::with_capacity(config.attributes.len());
    for attribute_config in &config.attributes {
        if attributes
            .iter()
            .any(|existing| existing.name == attribute_config.name)
        {
            return Err(MetadataError::InvalidConfig(format!(
                "attribute `{}.{}` is declared twice",
                config.name, attribute_config.name
            )));
        }
        let is_pk = config.pk.contains(&attribute_config.name);
        let attribute = AttributeDescription::from_config(&config.name, attribute_config, is_pk)?;
        if let Some(column) = &attribute.column {
            check_identifier(column)?;
        }
        attributes.push(attribute);
    }

    for pk in &config.pk {
        let mapped = attributes
            .iter()
            .find(|attribute| &attribute.name == pk)
            .map(AttributeDescription::is_mapped);
        match mapped {
            Some(true) => {}
            Some(false) => {
                return Err(MetadataError::InvalidConfig(format!(
                    "key `{}.{pk}` must be a persistent attribute",
                    config.name
                )))
            }
            None => {
                return Err(MetadataError::UnknownAttribute {
                    type_name: config.name.clone(),
                    name: pk.clone(),
                })
            }
        }
    }

    let mut default_order = Vec::with_capacity(config.default_order.len());
    for order in &config.default_order {
        let spec = OrderSpec::parse(&config.name, order)?;
        if !attributes.iter().any(|attribute| attribute.name == spec.field) {
            return Err(MetadataError::UnknownAttribute {
                type_name: config.name.clone(),
                name: spec.field,
            });
        }
        default_order.push(spec);
    }

    Ok(TypeMetadata {
        name: config.name.clone(),
        table,
        pk_names: config.pk.clone(),
        attributes,
        relations: Vec::new(),
        default_order,
    })
}

fn check_identifier(name: &str) -> MetadataResult<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(MetadataError::InvalidConfig(format!(
            "`{name}` is not a valid table or column name"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{MetadataRegistry, OrderSpec, SortDirection};
    use crate::meta::MetadataError;

    const MINIMAL: &str = r#"{
        "types": [
            {"name": "Author", "pk": ["id"], "attributes": [
                {"name": "id", "type": "integer"},
                {"name": "name"}
            ], "default_order": ["name"]},
            {"name": "Recipe", "pk": ["id"], "attributes": [
                {"name": "id", "type": "integer"},
                {"name": "name"}
            ]}
        ],
        "relations": [{
            "ends": [
                {"type": "Author", "role": "Author", "max": 1},
                {"type": "Recipe", "role": "Recipe"}
            ],
            "fk_column": "authorFk"
        }]
    }"#;

    #[test]
    fn order_spec_parses_direction() {
        let spec = OrderSpec::parse("Author", "name desc").expect("order");
        assert_eq!(spec.direction, SortDirection::Desc);
        assert_eq!(spec.to_string(), "name DESC");
        assert!(OrderSpec::parse("Author", "name sideways").is_err());
    }

    #[test]
    fn key_must_be_declared_attribute() {
        let json = r#"{"types": [{"name": "Ghost", "pk": ["id"], "attributes": [{"name": "name"}]}]}"#;
        assert!(matches!(
            MetadataRegistry::from_json_str(json),
            Err(MetadataError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn fk_column_must_not_shadow_attribute() {
        let json = MINIMAL.replace("\"fk_column\": \"authorFk\"", "\"fk_column\": \"name\"");
        assert!(matches!(
            MetadataRegistry::from_json_str(&json),
            Err(MetadataError::InvalidConfig(_))
        ));
    }

    #[test]
    fn paths_follow_hierarchy() {
        let registry = MetadataRegistry::from_json_str(MINIMAL).expect("registry");
        let up = registry.ancestor_path("Recipe", "Author").expect("ancestor path");
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].fk_column, "authorFk");
        assert!(registry.ancestor_path("Author", "Recipe").is_none());
        assert!(registry.connection_path("Author", "Recipe").is_some());
    }
}

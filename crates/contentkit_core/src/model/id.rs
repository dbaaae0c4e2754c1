//! Entity identity model.
//!
//! # Responsibility
//! - Identify one persistent entity by type and ordered key components.
//! - Serialize identities to the canonical `Type:comp1:comp2` string form.
//! - Mint provisional components for entities that are not inserted yet.
//!
//! # Invariants
//! - The canonical string is the only registry key; equality follows it.
//! - Components are non-empty and never contain the `:` separator.
//! - An id is provisional iff every component is a provisional marker.
//! - Ids are immutable values; a key change produces a new `EntityId`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Separator between the type name and each key component.
pub const ID_SEPARATOR: char = ':';

/// Prefix of every provisional key component.
pub const PROVISIONAL_PREFIX: &str = "prov";

static PROVISIONAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^prov[0-9a-f]{32}$").expect("valid provisional marker regex"));

/// Source of primary-key arity per type, used to validate parsed ids.
pub trait KeyCatalog {
    /// Returns the number of key fields for `type_name`, or `None` when the
    /// type is unknown.
    fn key_count(&self, type_name: &str) -> Option<usize>;
}

/// Identity parse/construction failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Serialized form is structurally invalid.
    Malformed(String),
    /// Type part does not name a known type.
    UnknownType(String),
    /// Component count differs from the declared key count.
    ArityMismatch {
        type_name: String,
        expected: usize,
        actual: usize,
    },
}

impl Display for IdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(value) => write!(f, "malformed entity id `{value}`"),
            Self::UnknownType(value) => write!(f, "entity id references unknown type `{value}`"),
            Self::ArityMismatch {
                type_name,
                expected,
                actual,
            } => write!(
                f,
                "entity id for `{type_name}` needs {expected} key component(s), got {actual}"
            ),
        }
    }
}

impl Error for IdError {}

/// Typed, possibly compound identifier of one entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    type_name: String,
    components: Vec<String>,
}

impl EntityId {
    /// Builds an id from already known components.
    ///
    /// Only structural rules are checked; use [`EntityId::parse`] when the
    /// type and key arity must be verified against metadata.
    pub fn new<T, C>(type_name: T, components: impl IntoIterator<Item = C>) -> Result<Self, IdError>
    where
        T: Into<String>,
        C: Into<String>,
    {
        let type_name = type_name.into();
        let components = components.into_iter().map(Into::into).collect::<Vec<_>>();
        let candidate = Self {
            type_name,
            components,
        };
        candidate.check_structure()?;
        Ok(candidate)
    }

    /// Parses a serialized id and validates it against `catalog`.
    ///
    /// # Errors
    /// - `Malformed` when no separator is present or a part is empty.
    /// - `UnknownType` when the catalog does not know the type.
    /// - `ArityMismatch` when the component count differs from the key count.
    pub fn parse(serialized: &str, catalog: &dyn KeyCatalog) -> Result<Self, IdError> {
        let id = Self::parse_structure(serialized)?;
        let expected = catalog
            .key_count(&id.type_name)
            .ok_or_else(|| IdError::UnknownType(id.type_name.clone()))?;
        if expected != id.components.len() {
            return Err(IdError::ArityMismatch {
                type_name: id.type_name,
                expected,
                actual: id.components.len(),
            });
        }
        Ok(id)
    }

    /// Non-failing validity predicate over [`EntityId::parse`].
    pub fn is_valid(serialized: &str, catalog: &dyn KeyCatalog) -> bool {
        Self::parse(serialized, catalog).is_ok()
    }

    /// Creates a fully provisional id for `type_name`.
    pub fn new_provisional(type_name: &str, catalog: &dyn KeyCatalog) -> Result<Self, IdError> {
        let count = catalog
            .key_count(type_name)
            .ok_or_else(|| IdError::UnknownType(type_name.to_string()))?;
        Self::provisional_from(type_name, catalog, &vec![None; count])
    }

    /// Creates an id whose missing key slots are filled with provisional
    /// markers.
    pub fn provisional_from(
        type_name: &str,
        catalog: &dyn KeyCatalog,
        partial: &[Option<String>],
    ) -> Result<Self, IdError> {
        let expected = catalog
            .key_count(type_name)
            .ok_or_else(|| IdError::UnknownType(type_name.to_string()))?;
        if partial.len() != expected {
            return Err(IdError::ArityMismatch {
                type_name: type_name.to_string(),
                expected,
                actual: partial.len(),
            });
        }
        let components = partial
            .iter()
            .map(|slot| match slot {
                Some(value) => value.clone(),
                None => provisional_component(),
            })
            .collect::<Vec<_>>();
        Self::new(type_name, components)
    }

    /// Type lookup key.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Ordered key components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Returns whether every component is a provisional marker.
    pub fn is_provisional(&self) -> bool {
        self.components
            .iter()
            .all(|component| is_provisional_component(component))
    }

    /// Returns whether at least one component is a provisional marker.
    pub fn has_provisional_component(&self) -> bool {
        self.components
            .iter()
            .any(|component| is_provisional_component(component))
    }

    /// Returns a copy with the component at `index` replaced.
    pub fn with_component(&self, index: usize, value: impl Into<String>) -> Result<Self, IdError> {
        if index >= self.components.len() {
            return Err(IdError::ArityMismatch {
                type_name: self.type_name.clone(),
                expected: self.components.len(),
                actual: index + 1,
            });
        }
        let mut components = self.components.clone();
        components[index] = value.into();
        Self::new(self.type_name.clone(), components)
    }

    fn parse_structure(serialized: &str) -> Result<Self, IdError> {
        let trimmed = serialized.trim();
        let mut parts = trimmed.split(ID_SEPARATOR);
        let type_name = parts.next().unwrap_or_default().to_string();
        let components = parts.map(str::to_string).collect::<Vec<_>>();
        if components.is_empty() {
            return Err(IdError::Malformed(serialized.to_string()));
        }
        let id = Self {
            type_name,
            components,
        };
        id.check_structure()
            .map_err(|_| IdError::Malformed(serialized.to_string()))?;
        Ok(id)
    }

    fn check_structure(&self) -> Result<(), IdError> {
        let type_ok = !self.type_name.trim().is_empty() && !self.type_name.contains(ID_SEPARATOR);
        let components_ok = !self.components.is_empty()
            && self
                .components
                .iter()
                .all(|component| !component.is_empty() && !component.contains(ID_SEPARATOR));
        if type_ok && components_ok {
            Ok(())
        } else {
            Err(IdError::Malformed(self.to_string()))
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name)?;
        for component in &self.components {
            write!(f, "{ID_SEPARATOR}{component}")?;
        }
        Ok(())
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for EntityId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_structure(&value)
    }
}

/// Generates one fresh provisional key component.
pub fn provisional_component() -> String {
    format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4().simple())
}

/// Returns whether `value` matches the provisional marker pattern.
pub fn is_provisional_component(value: &str) -> bool {
    PROVISIONAL_RE.is_match(value)
}

#[cfg(test)]
mod tests {
    use super::{is_provisional_component, provisional_component, EntityId, IdError, KeyCatalog};

    struct Catalog;

    impl KeyCatalog for Catalog {
        fn key_count(&self, type_name: &str) -> Option<usize> {
            match type_name {
                "Author" => Some(1),
                "Translation" => Some(2),
                _ => None,
            }
        }
    }

    #[test]
    fn provisional_component_has_fixed_width() {
        let marker = provisional_component();
        assert_eq!(marker.len(), 36);
        assert!(is_provisional_component(&marker));
        assert!(!is_provisional_component("prov1234"));
    }

    #[test]
    fn parse_rejects_missing_separator() {
        let err = EntityId::parse("Author", &Catalog).expect_err("no separator must fail");
        assert!(matches!(err, IdError::Malformed(_)));
    }

    #[test]
    fn parse_checks_type_and_arity() {
        assert!(matches!(
            EntityId::parse("Ghost:1", &Catalog),
            Err(IdError::UnknownType(_))
        ));
        assert!(matches!(
            EntityId::parse("Translation:1", &Catalog),
            Err(IdError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
        assert!(EntityId::is_valid("Translation:1:de", &Catalog));
    }

    #[test]
    fn partially_known_key_is_not_provisional() {
        let id = EntityId::provisional_from("Translation", &Catalog, &[Some("7".to_string()), None])
            .expect("partial id");
        assert!(!id.is_provisional());
        assert!(id.has_provisional_component());
        assert_eq!(id.components()[0], "7");
    }

    #[test]
    fn serde_uses_canonical_string() {
        let id = EntityId::new("Author", ["12"]).expect("id");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"Author:12\"");
        let back: EntityId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}

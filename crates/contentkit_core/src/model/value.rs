//! Typed entity values.
//!
//! Relation roles hold lookup keys (`Reference`/`References`), never live
//! entity handles.

use crate::model::id::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One attribute or relation value carried by an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Text(String),
    /// To-one relation value.
    Reference(EntityId),
    /// To-many relation value.
    References(Vec<EntityId>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns whether this value belongs to a relation role.
    pub fn is_relation(&self) -> bool {
        matches!(self, Self::Reference(_) | Self::References(_))
    }

    /// Text rendering used for restriction checks and key components.
    ///
    /// Returns `None` for null and relation values.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null | Self::Reference(_) | Self::References(_) => None,
            Self::Integer(value) => Some(value.to_string()),
            Self::Real(value) => Some(value.to_string()),
            Self::Boolean(value) => Some(if *value { "1" } else { "0" }.to_string()),
            Self::Text(value) => Some(value.clone()),
        }
    }

    pub fn as_reference(&self) -> Option<&EntityId> {
        match self {
            Self::Reference(id) => Some(id),
            _ => None,
        }
    }

    /// Ids referenced by this value (empty for plain values).
    pub fn referenced_ids(&self) -> Vec<&EntityId> {
        match self {
            Self::Reference(id) => vec![id],
            Self::References(ids) => ids.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Replaces every occurrence of `old` with `new`; returns whether the
    /// value changed.
    pub fn replace_reference(&mut self, old: &EntityId, new: &EntityId) -> bool {
        match self {
            Self::Reference(id) if id == old => {
                *id = new.clone();
                true
            }
            Self::References(ids) => {
                let mut changed = false;
                for id in ids.iter_mut().filter(|id| *id == old) {
                    *id = new.clone();
                    changed = true;
                }
                changed
            }
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Reference(id) => write!(f, "{id}"),
            Self::References(ids) => {
                let joined = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "[{}]", joined.join(", "))
            }
            other => write!(f, "{}", other.as_text().unwrap_or_default()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<EntityId> for Value {
    fn from(value: EntityId) -> Self {
        Self::Reference(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

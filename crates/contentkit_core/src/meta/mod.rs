//! Type metadata: keys, attributes, relations and default ordering.
//!
//! # Responsibility
//! - Load declarative type metadata once and validate it.
//! - Answer pure metadata reads for mappers, the query builder and the facade.
//!
//! # Invariants
//! - A loaded `MetadataRegistry` is immutable; share it through `Arc`.
//! - Every navigable relation direction is registered on its own type.
//! - Parent/child classification is derived from multiplicities only.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod attribute;
mod registry;
mod relation;

pub use attribute::{
    AttributeConfig, AttributeDescription, AttributeReference, TagMatch, ValueType,
};
pub use registry::{
    MetadataConfig, MetadataRegistry, OrderSpec, SortDirection, TypeConfig, TypeMetadata,
};
pub use relation::{
    Aggregation, Hierarchy, Multiplicity, RelationConfig, RelationDescription, RelationEndConfig,
};

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Metadata loading and lookup failures.
#[derive(Debug)]
pub enum MetadataError {
    UnknownType(String),
    UnknownAttribute { type_name: String, name: String },
    InvalidConfig(String),
    InvalidPattern { attribute: String, message: String },
    Parse(serde_json::Error),
    Io(std::io::Error),
}

impl Display for MetadataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(name) => write!(f, "unknown type `{name}`"),
            Self::UnknownAttribute { type_name, name } => {
                write!(f, "type `{type_name}` has no attribute `{name}`")
            }
            Self::InvalidConfig(message) => write!(f, "invalid metadata: {message}"),
            Self::InvalidPattern { attribute, message } => {
                write!(f, "invalid restriction pattern on `{attribute}`: {message}")
            }
            Self::Parse(err) => write!(f, "metadata parse error: {err}"),
            Self::Io(err) => write!(f, "metadata read error: {err}"),
        }
    }
}

impl Error for MetadataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

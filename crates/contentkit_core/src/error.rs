//! Top-level error taxonomy of the persistence core.
//!
//! Layer errors (`IdError`, `MetadataError`, `EntityError`, `QueryError`,
//! `DbError`) convert into `PersistenceError` with `?`.

use crate::db::DbError;
use crate::meta::MetadataError;
use crate::model::entity::EntityError;
use crate::model::id::{EntityId, IdError};
use crate::query::QueryError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug)]
pub enum PersistenceError {
    InvalidIdentity(IdError),
    UnknownType(String),
    UnknownField { type_name: String, field: String },
    ValidationFailed { attribute: String, message: String },
    AuthorizationFailed { resource: String, action: String },
    PessimisticLockConflict { object_id: EntityId, holder_login: String },
    OptimisticLockConflict { object_id: EntityId },
    Query(QueryError),
    Configuration(MetadataError),
    Entity(EntityError),
    NotFound(EntityId),
    InvalidData(String),
    TransactionNotActive,
    CommitCascadeLimit { rounds: usize },
    Db(DbError),
}

impl Display for PersistenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentity(err) => write!(f, "{err}"),
            Self::UnknownType(name) => write!(f, "unknown type `{name}`"),
            Self::UnknownField { type_name, field } => {
                write!(f, "type `{type_name}` has no field `{field}`")
            }
            Self::ValidationFailed { attribute, message } => {
                write!(f, "validation failed for `{attribute}`: {message}")
            }
            Self::AuthorizationFailed { resource, action } => {
                write!(f, "not authorized to {action} {resource}")
            }
            Self::PessimisticLockConflict {
                object_id,
                holder_login,
            } => write!(f, "{object_id} is locked by {holder_login}"),
            Self::OptimisticLockConflict { object_id } => {
                write!(f, "{object_id} was changed by another user")
            }
            Self::Query(err) => write!(f, "{err}"),
            Self::Configuration(err) => write!(f, "{err}"),
            Self::Entity(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "entity not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::TransactionNotActive => write!(f, "transaction is not active"),
            Self::CommitCascadeLimit { rounds } => {
                write!(f, "commit did not settle after {rounds} rounds")
            }
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for PersistenceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidIdentity(err) => Some(err),
            Self::Query(err) => Some(err),
            Self::Configuration(err) => Some(err),
            Self::Entity(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<IdError> for PersistenceError {
    fn from(value: IdError) -> Self {
        Self::InvalidIdentity(value)
    }
}

impl From<MetadataError> for PersistenceError {
    fn from(value: MetadataError) -> Self {
        match value {
            MetadataError::UnknownType(name) => Self::UnknownType(name),
            MetadataError::UnknownAttribute { type_name, name } => Self::UnknownField {
                type_name,
                field: name,
            },
            other => Self::Configuration(other),
        }
    }
}

impl From<EntityError> for PersistenceError {
    fn from(value: EntityError) -> Self {
        match value {
            EntityError::InvalidKey(err) => Self::InvalidIdentity(err),
            other => Self::Entity(other),
        }
    }
}

impl From<QueryError> for PersistenceError {
    fn from(value: QueryError) -> Self {
        Self::Query(value)
    }
}

impl From<DbError> for PersistenceError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

//! Query composition and execution.
//!
//! # Responsibility
//! - Turn template forests (`ObjectQuery`) and qualified condition strings
//!   (`StringQuery`) into one relational `SelectStatement`.
//! - Execute statements through a relational mapper with ordering, paging
//!   and build depth.
//!
//! # Invariants
//! - Every table and column in generated SQL comes from type metadata;
//!   user-provided values only appear as quoted literals.
//! - Composition errors fail the whole query; no partial SQL is produced.

use crate::meta::{MetadataError, MetadataRegistry, RelationDescription};
use std::error::Error;
use std::fmt::{Display, Formatter};

mod condition;
mod exec;
mod object_query;
mod string_query;

pub use condition::{quote_literal, BoolOperator, ComparisonOperator, Criterion};
pub use exec::{run_select, PagingInfo, QueryOutput};
pub use object_query::{GroupId, ObjectQuery, TemplateId};
pub use string_query::StringQuery;

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug)]
pub enum QueryError {
    UnknownType(String),
    UnknownField { type_name: String, field: String },
    /// A field reference in a condition string lacks its `Type.` prefix.
    MissingTypeQualifier(String),
    NoConnectionBetweenTypes { from: String, to: String },
    Malformed { query: String, message: String },
    /// The root type's mapper cannot run relational queries.
    NotRelational(String),
    /// A root template is not of the query's root type.
    DisconnectedTemplate { expected: String, actual: String },
    /// A child template's type is not related to its parent's type.
    NoRelation { from: String, to: String },
    UnknownTemplate(usize),
    Metadata(MetadataError),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(name) => write!(f, "unknown type `{name}` in query"),
            Self::UnknownField { type_name, field } => {
                write!(f, "type `{type_name}` has no queryable field `{field}`")
            }
            Self::MissingTypeQualifier(token) => {
                write!(f, "field `{token}` must be written as `Type.{token}`")
            }
            Self::NoConnectionBetweenTypes { from, to } => {
                write!(f, "no relation path connects `{from}` and `{to}`")
            }
            Self::Malformed { query, message } => write!(f, "malformed query `{query}`: {message}"),
            Self::NotRelational(name) => write!(f, "mapper for `{name}` does not support queries"),
            Self::DisconnectedTemplate { expected, actual } => write!(
                f,
                "root template of type `{actual}` does not match query type `{expected}`"
            ),
            Self::NoRelation { from, to } => write!(f, "`{from}` has no relation to `{to}`"),
            Self::UnknownTemplate(index) => write!(f, "template #{index} does not exist"),
            Self::Metadata(err) => write!(f, "{err}"),
        }
    }
}

impl Error for QueryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Metadata(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MetadataError> for QueryError {
    fn from(value: MetadataError) -> Self {
        match value {
            MetadataError::UnknownType(name) => Self::UnknownType(name),
            MetadataError::UnknownAttribute { type_name, name } => Self::UnknownField {
                type_name,
                field: name,
            },
            other => Self::Metadata(other),
        }
    }
}

/// Relational shape of a composed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStatement {
    pub root_type: String,
    /// Qualifier of the root type's columns.
    pub root_alias: String,
    /// FROM entries, either `Table` or `Table AS Alias`.
    pub tables: Vec<String>,
    /// Combined condition; empty means no restriction.
    pub condition: String,
    /// Foreign key equalities linking the tables.
    pub joins: Vec<String>,
}

impl SelectStatement {
    pub fn where_clause(&self) -> String {
        let condition = if self.condition.is_empty() {
            "1"
        } else {
            self.condition.as_str()
        };
        if self.joins.is_empty() {
            condition.to_string()
        } else {
            format!("{condition} AND {}", self.joins.join(" AND "))
        }
    }

    pub fn from_clause(&self) -> String {
        self.tables.join(", ")
    }

    /// `SELECT DISTINCT` over `projection` without ordering or paging.
    pub fn to_sql(&self, projection: &[String]) -> String {
        format!(
            "SELECT DISTINCT {} FROM {} WHERE {}",
            projection.join(", "),
            self.from_clause(),
            self.where_clause()
        )
    }

    pub(crate) fn add_table(&mut self, entry: String) {
        if !self.tables.contains(&entry) {
            self.tables.push(entry);
        }
    }

    pub(crate) fn add_join(&mut self, join: String) {
        if !self.joins.contains(&join) {
            self.joins.push(join);
        }
    }
}

/// Query source accepted by the facade.
#[derive(Debug, Clone)]
pub enum QuerySpec {
    Templates(ObjectQuery),
    /// Condition string with `Type.attribute` field references.
    Condition(String),
}

impl QuerySpec {
    pub fn statement(&self, root_type: &str, registry: &MetadataRegistry) -> QueryResult<SelectStatement> {
        match self {
            Self::Templates(query) => {
                if query.root_type() != root_type {
                    return Err(QueryError::DisconnectedTemplate {
                        expected: root_type.to_string(),
                        actual: query.root_type().to_string(),
                    });
                }
                query.build(registry)
            }
            Self::Condition(condition) => StringQuery::new(root_type, condition.clone()).build(registry),
        }
    }
}

/// Join equality for one relation step from `this_alias` to `other_alias`.
///
/// The foreign key lives on the child side and points at the parent's
/// single key column.
pub(crate) fn join_condition(
    registry: &MetadataRegistry,
    relation: &RelationDescription,
    this_alias: &str,
    other_alias: &str,
) -> QueryResult<String> {
    let parent_type = relation.parent_type();
    let parent_key = registry
        .type_metadata(parent_type)?
        .pk_columns()
        .first()
        .map(|column| column.to_string())
        .ok_or_else(|| QueryError::Malformed {
            query: format!("{} -> {}", relation.this_type, relation.other_type),
            message: format!("type `{parent_type}` has no key column"),
        })?;
    let (child_alias, parent_alias) = if relation.is_child() {
        (other_alias, this_alias)
    } else {
        (this_alias, other_alias)
    };
    Ok(format!(
        "{child_alias}.{} = {parent_alias}.{parent_key}",
        relation.fk_column
    ))
}

#[cfg(test)]
mod tests {
    use super::SelectStatement;

    #[test]
    fn empty_condition_is_tautology() {
        let statement = SelectStatement {
            root_type: "Author".to_string(),
            root_alias: "Author".to_string(),
            tables: vec!["Author".to_string()],
            condition: String::new(),
            joins: Vec::new(),
        };
        assert_eq!(statement.where_clause(), "1");
        assert_eq!(
            statement.to_sql(&["Author.id".to_string()]),
            "SELECT DISTINCT Author.id FROM Author WHERE 1"
        );
    }
}

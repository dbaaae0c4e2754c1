//! Statement execution with ordering, paging and build depth.

use crate::error::PersistenceResult;
use crate::mapper::{filter_for, AttributeFilter, BuildDepth, MapperRegistry};
use crate::meta::{SortDirection, TypeMetadata};
use crate::model::entity::Entity;
use crate::model::id::EntityId;
use crate::query::{QueryError, SelectStatement};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static ORDER_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("valid order field regex")
});

/// Page request; `total_count` is filled by the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingInfo {
    pub page_size: u32,
    pub offset: u64,
    pub total_count: Option<u64>,
}

impl PagingInfo {
    pub fn new(page_size: u32, offset: u64) -> Self {
        Self {
            page_size,
            offset,
            total_count: None,
        }
    }

    /// Offset of the next page when more rows remain.
    pub fn next_offset(&self) -> Option<u64> {
        let next = self.offset + u64::from(self.page_size);
        match self.total_count {
            Some(total) if next < total => Some(next),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum QueryOutput {
    Ids(Vec<EntityId>),
    /// Matching entities plus everything expanded for the build depth.
    Entities {
        items: Vec<Entity>,
        related: Vec<Entity>,
    },
}

impl QueryOutput {
    pub fn ids(&self) -> Vec<EntityId> {
        match self {
            Self::Ids(ids) => ids.clone(),
            Self::Entities { items, .. } => items.iter().map(|item| item.id().clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::Entities { items, .. } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs `statement` through the root type's relational mapper.
///
/// Without explicit `order` the mapper's default order applies. Unqualified
/// root attributes in `order` get the root qualifier; qualified fields are
/// used as written.
pub fn run_select(
    mappers: &MapperRegistry,
    statement: &SelectStatement,
    depth: BuildDepth,
    order: &[String],
    paging: Option<&mut PagingInfo>,
    filter: &AttributeFilter,
) -> PersistenceResult<QueryOutput> {
    let mapper = mappers.get(&statement.root_type)?;
    let relational = mapper
        .relational()
        .ok_or_else(|| QueryError::NotRelational(statement.root_type.clone()))?;
    let metadata = mapper.metadata()?;
    let type_filter = filter_for(filter, &statement.root_type);

    let projection = if depth == BuildDepth::IdsOnly {
        relational.key_columns(&statement.root_alias)?
    } else {
        relational.select_columns(&statement.root_alias, type_filter)?
    };
    let mut sql = statement.to_sql(&projection);

    let order_terms = if order.is_empty() {
        mapper
            .default_order(None)?
            .iter()
            .filter_map(|spec| {
                metadata
                    .column_for(&spec.field)
                    .map(|column| format!("{}.{column} {}", statement.root_alias, spec.direction.as_sql()))
            })
            .collect::<Vec<_>>()
    } else {
        order
            .iter()
            .map(|term| order_term(term, metadata, &statement.root_alias))
            .collect::<Result<Vec<_>, _>>()?
    };
    if !order_terms.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_terms.join(", "));
    }

    if let Some(paging) = paging {
        let keys = relational.key_columns(&statement.root_alias)?;
        let count_sql = format!("SELECT COUNT(*) FROM ({})", statement.to_sql(&keys));
        paging.total_count = Some(relational.count(&count_sql)?);
        sql.push_str(&format!(" LIMIT {} OFFSET {}", paging.page_size, paging.offset));
    }
    debug!(
        "event=query_execute module=query status=start type={} sql={sql}",
        statement.root_type
    );

    if depth == BuildDepth::IdsOnly {
        return Ok(QueryOutput::Ids(relational.select_ids(&sql)?));
    }
    let mut items = relational.select_entities(&sql, type_filter)?;
    let mut related = Vec::new();
    let mut visited = items
        .iter()
        .map(|item| item.id().to_string())
        .collect::<HashSet<_>>();
    for item in &mut items {
        mappers.expand(item, depth, filter, None, &mut visited, &mut related)?;
    }
    debug!(
        "event=query_execute module=query status=ok type={} items={} related={}",
        statement.root_type,
        items.len(),
        related.len()
    );
    Ok(QueryOutput::Entities { items, related })
}

fn order_term(term: &str, metadata: &TypeMetadata, root_alias: &str) -> Result<String, QueryError> {
    let malformed = || QueryError::Malformed {
        query: term.to_string(),
        message: "expected `field [ASC|DESC]`".to_string(),
    };
    let mut parts = term.split_whitespace();
    let field = parts.next().ok_or_else(malformed)?;
    let direction = match parts.next() {
        None => SortDirection::Asc,
        Some(word) if word.eq_ignore_ascii_case("asc") => SortDirection::Asc,
        Some(word) if word.eq_ignore_ascii_case("desc") => SortDirection::Desc,
        Some(_) => return Err(malformed()),
    };
    if parts.next().is_some() || !ORDER_FIELD_RE.is_match(field) {
        return Err(malformed());
    }
    if field.contains('.') {
        return Ok(format!("{field} {}", direction.as_sql()));
    }
    if !metadata.has_attribute(field) {
        return Err(QueryError::UnknownField {
            type_name: metadata.name().to_string(),
            field: field.to_string(),
        });
    }
    let column = metadata.column_for(field).ok_or_else(malformed)?;
    Ok(format!("{root_alias}.{column} {}", direction.as_sql()))
}

#[cfg(test)]
mod tests {
    use super::PagingInfo;

    #[test]
    fn next_offset_stops_at_total() {
        let mut paging = PagingInfo::new(10, 0);
        assert_eq!(paging.next_offset(), None);
        paging.total_count = Some(25);
        assert_eq!(paging.next_offset(), Some(10));
        paging.offset = 20;
        assert_eq!(paging.next_offset(), None);
    }
}

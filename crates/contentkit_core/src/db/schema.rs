//! Entity table bootstrap derived from type metadata.
//!
//! # Invariants
//! - DDL is idempotent (`CREATE ... IF NOT EXISTS`).
//! - A single integer key becomes the table's `INTEGER PRIMARY KEY`, so
//!   inserts without a key receive one from SQLite.
//! - Every parent relation adds one foreign-key column to the child table.
//!   Foreign keys are not declared as constraints; the unit of work orders
//!   writes and nulls references to unsaved parents.

use super::DbResult;
use crate::meta::{MetadataRegistry, TypeMetadata, ValueType};
use log::info;
use rusqlite::Connection;

/// Creates missing tables for every configured type.
pub fn ensure_entity_tables(conn: &Connection, registry: &MetadataRegistry) -> DbResult<()> {
    let mut created = 0usize;
    for type_name in registry.type_names() {
        let Ok(metadata) = registry.type_metadata(type_name) else {
            continue;
        };
        conn.execute_batch(&table_ddl(metadata))?;
        created += 1;
    }
    info!("event=schema_bootstrap module=db status=ok tables={created}");
    Ok(())
}

/// `CREATE TABLE` plus foreign-key indexes for one type.
pub fn table_ddl(metadata: &TypeMetadata) -> String {
    let single_integer_key = match metadata.pk_names() {
        [pk] => metadata
            .attribute(pk)
            .is_some_and(|attribute| attribute.value_type == ValueType::Integer),
        _ => false,
    };

    let mut columns = Vec::new();
    for attribute in metadata.attributes() {
        let Some(column) = attribute.column.as_deref() else {
            continue;
        };
        if single_integer_key && attribute.is_primary_key {
            columns.push(format!("{column} INTEGER PRIMARY KEY"));
        } else if metadata.pk_names().len() == 1 && attribute.is_primary_key {
            columns.push(format!("{column} {} PRIMARY KEY", attribute.value_type.sql_type()));
        } else {
            columns.push(format!("{column} {}", attribute.value_type.sql_type()));
        }
    }

    let mut fk_columns = Vec::new();
    for relation in metadata.parent_relations() {
        if !fk_columns.contains(&relation.fk_column) {
            fk_columns.push(relation.fk_column.clone());
        }
    }
    columns.extend(fk_columns.iter().map(|column| format!("{column} INTEGER")));

    if metadata.pk_names().len() > 1 {
        columns.push(format!("PRIMARY KEY ({})", metadata.pk_columns().join(", ")));
    }

    let table = metadata.table();
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n);",
        columns.join(",\n    ")
    );
    for column in &fk_columns {
        ddl.push_str(&format!(
            "\nCREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table} ({column});"
        ));
    }
    ddl
}

#[cfg(test)]
mod tests {
    use super::table_ddl;
    use crate::meta::MetadataRegistry;

    #[test]
    fn compound_key_and_fk_columns() {
        let registry = MetadataRegistry::from_json_str(
            r#"{
                "types": [
                    {"name": "Recipe", "pk": ["id"], "attributes": [{"name": "id", "type": "integer"}]},
                    {"name": "Step", "pk": ["recipe_no", "position"], "attributes": [
                        {"name": "recipe_no", "type": "integer"},
                        {"name": "position", "type": "integer"},
                        {"name": "text", "type": "text"}
                    ]}
                ],
                "relations": [{
                    "ends": [
                        {"type": "Recipe", "role": "Recipe", "max": 1},
                        {"type": "Step", "role": "Step"}
                    ],
                    "fk_column": "recipeFk"
                }]
            }"#,
        )
        .expect("registry");

        let recipe = table_ddl(registry.type_metadata("Recipe").expect("recipe"));
        assert!(recipe.contains("id INTEGER PRIMARY KEY"));

        let step = table_ddl(registry.type_metadata("Step").expect("step"));
        assert!(step.contains("recipeFk INTEGER"));
        assert!(step.contains("PRIMARY KEY (recipe_no, position)"));
        assert!(step.contains("idx_Step_recipeFk"));
    }
}

//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `contentkit_core` linkage.
//! - Optionally validate a metadata file and bootstrap its tables, in memory
//!   unless a database path is given.
//!
//! Usage: `contentkit_cli [metadata.json [database.sqlite]]`

use contentkit_core::db::schema::table_ddl;
use contentkit_core::{
    open_db, open_db_in_memory, AllowAll, CoreConfig, MetadataRegistry, PersistenceFacade, SqliteStore,
    StaticSession, SystemClock,
};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;

fn main() -> ExitCode {
    println!("contentkit_core ping={}", contentkit_core::ping());
    println!("contentkit_core version={}", contentkit_core::core_version());

    let mut args = std::env::args().skip(1);
    let Some(metadata_path) = args.next() else {
        return ExitCode::SUCCESS;
    };
    match run(&metadata_path, args.next()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(metadata_path: &str, db_path: Option<String>) -> Result<(), String> {
    let registry = MetadataRegistry::from_path(metadata_path).map_err(|err| err.to_string())?;
    for type_name in registry.type_names() {
        let metadata = registry.type_metadata(type_name).map_err(|err| err.to_string())?;
        println!(
            "type={type_name} table={} keys={} attributes={} relations={}",
            metadata.table(),
            metadata.pk_names().join(","),
            metadata.attributes().len(),
            metadata.relations().len()
        );
        println!("  {}", table_ddl(metadata));
    }

    let conn = match &db_path {
        Some(path) => open_db(path),
        None => open_db_in_memory(),
    }
    .map_err(|err| err.to_string())?;
    let facade = PersistenceFacade::open_sqlite(
        Arc::new(registry),
        Rc::new(SqliteStore::new(conn)),
        Rc::new(StaticSession::anonymous(3600)),
        Rc::new(SystemClock),
        Rc::new(AllowAll),
        CoreConfig::default(),
    )
    .map_err(|err| err.to_string())?;
    println!(
        "database={} types={}",
        db_path.as_deref().unwrap_or(":memory:"),
        facade.mappers().type_names().join(",")
    );
    Ok(())
}

//! Persistence core for content objects.
//!
//! Identity, type metadata, mappers, unit of work, locking and query
//! composition over SQLite, exposed through `PersistenceFacade`.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod facade;
pub mod lock;
pub mod logging;
pub mod mapper;
pub mod meta;
pub mod model;
pub mod query;
pub mod uow;

pub use config::{ConfigError, CoreConfig, LockingMode};
pub use context::{
    Action, AllowAll, Authorizer, Clock, ManualClock, Principal, SessionContext, StaticSession,
    SystemClock,
};
pub use db::{open_db, open_db_in_memory, DbError, SqliteStore};
pub use error::{PersistenceError, PersistenceResult};
pub use facade::{PersistenceFacade, QueryHits};
pub use lock::{EditAccess, Lock, LockManager, LockType};
pub use logging::{default_log_level, init_logging, logging_status};
pub use mapper::{AttributeFilter, BuildDepth, Mapper, MapperRegistry, RelationalMapper, SqliteMapper};
pub use meta::{MetadataError, MetadataRegistry, TagMatch};
pub use model::entity::{Entity, EntityRef, EntityState, ValueProperty};
pub use model::id::{EntityId, IdError, KeyCatalog};
pub use model::observer::ChangeObserver;
pub use model::value::Value;
pub use query::{
    BoolOperator, ComparisonOperator, Criterion, ObjectQuery, PagingInfo, QueryError, QuerySpec,
    StringQuery,
};
pub use uow::{CommitTarget, Transaction, TransactionStatus};

/// Minimal health-check API.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}

//! Shared SQLite store with re-entrant storage transaction control.

use super::{open_db, open_db_in_memory, DbResult};
use log::debug;
use rusqlite::Connection;
use std::path::Path;

/// One connection shared by every mapper and the lock manager.
///
/// `begin` on an open storage transaction and `commit`/`rollback` without
/// one are no-ops, so every participant may call them independently.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::new(open_db(path)?))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::new(open_db_in_memory()?))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Starts a storage transaction; returns `false` when one is open.
    pub fn begin(&self) -> DbResult<bool> {
        if self.in_transaction() {
            return Ok(false);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        debug!("event=store_tx module=db status=begin");
        Ok(true)
    }

    pub fn commit(&self) -> DbResult<()> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT;")?;
        debug!("event=store_tx module=db status=commit");
        Ok(())
    }

    pub fn rollback(&self) -> DbResult<()> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK;")?;
        debug!("event=store_tx module=db status=rollback");
        Ok(())
    }
}

//! SQLite-backed lock manager.

use crate::context::{Action, Authorizer, Clock, SessionContext};
use crate::db::{DbError, SqliteStore};
use crate::lock::{EditAccess, Lock, LockType};
use crate::model::id::EntityId;
use log::{error, info, warn};
use rusqlite::{params, ErrorCode, OptionalExtension, Params, Row};
use std::rc::Rc;

pub type LockResult<T> = Result<T, DbError>;

const LOCK_SELECT_SQL: &str = "SELECT
    object_id,
    lock_type,
    user_id,
    login,
    session_id,
    created_at,
    snapshot
FROM object_locks";

/// Issues, reads and releases locks for the current session's principal.
pub struct LockManager {
    store: Rc<SqliteStore>,
    session: Rc<dyn SessionContext>,
    clock: Rc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Rc<SqliteStore>, session: Rc<dyn SessionContext>, clock: Rc<dyn Clock>) -> Self {
        Self {
            store,
            session,
            clock,
        }
    }

    /// Acquires a pessimistic lock on `object_id`.
    ///
    /// A live lock is returned unchanged, whoever holds it; compare
    /// `holder_user_id` to tell a conflict from an own lock. Without a
    /// principal no lock is created and `None` is returned.
    pub fn acquire_lock(&self, object_id: &EntityId) -> LockResult<Option<Lock>> {
        self.acquire(object_id, LockType::Pessimistic, None)
    }

    /// Acquires a lock of `lock_type`; optimistic locks carry `snapshot`
    /// and replace an earlier optimistic lock of the same session.
    pub fn acquire(
        &self,
        object_id: &EntityId,
        lock_type: LockType,
        snapshot: Option<String>,
    ) -> LockResult<Option<Lock>> {
        if lock_type == LockType::Pessimistic {
            if let Some(existing) = self.get_lock(object_id)? {
                return Ok(Some(existing));
            }
        }
        let Some(principal) = self.session.current_principal() else {
            info!(
                "event=lock_acquire module=lock status=skipped reason=no_principal object_id={object_id}"
            );
            return Ok(None);
        };

        let lock = Lock {
            object_id: object_id.clone(),
            lock_type,
            holder_user_id: principal.id,
            holder_login: principal.login,
            session_id: self.session.current_session_id(),
            created_at: self.clock.now_millis(),
            snapshot: if lock_type == LockType::Optimistic {
                snapshot
            } else {
                None
            },
        };

        let conn = self.store.connection();
        if lock_type == LockType::Optimistic {
            conn.execute(
                "DELETE FROM object_locks
                 WHERE object_id = ?1 AND lock_type = 'optimistic'
                   AND user_id = ?2 AND session_id = ?3;",
                params![
                    lock.object_id.to_string(),
                    lock.holder_user_id.as_str(),
                    lock.session_id.as_str()
                ],
            )?;
        }
        let inserted = conn.execute(
            "INSERT INTO object_locks (
                object_id,
                lock_type,
                user_id,
                login,
                session_id,
                created_at,
                snapshot
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                lock.object_id.to_string(),
                lock.lock_type.as_str(),
                lock.holder_user_id.as_str(),
                lock.holder_login.as_str(),
                lock.session_id.as_str(),
                lock.created_at,
                lock.snapshot.as_deref(),
            ],
        );
        match inserted {
            Ok(_) => {
                info!(
                    "event=lock_acquire module=lock status=ok type={} object_id={} holder={}",
                    lock.lock_type, lock.object_id, lock.holder_login
                );
                Ok(Some(lock))
            }
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                // Lost the race against another session's pessimistic lock.
                self.get_lock(object_id)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reads the pessimistic lock on `object_id`.
    ///
    /// An expired lock releases every lock on the object and yields `None`.
    pub fn get_lock(&self, object_id: &EntityId) -> LockResult<Option<Lock>> {
        let lock = self.select_one(
            &format!("{LOCK_SELECT_SQL} WHERE object_id = ?1 AND lock_type = 'pessimistic';"),
            params![object_id.to_string()],
        )?;
        match lock {
            Some(lock) if self.is_expired(&lock) => {
                self.expire(object_id);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Optimistic lock of the current principal and session.
    pub fn get_optimistic_lock(&self, object_id: &EntityId) -> LockResult<Option<Lock>> {
        let Some(principal) = self.session.current_principal() else {
            return Ok(None);
        };
        let session_id = self.session.current_session_id();
        let lock = self.select_one(
            &format!(
                "{LOCK_SELECT_SQL}
                 WHERE object_id = ?1 AND lock_type = 'optimistic'
                   AND user_id = ?2 AND session_id = ?3;"
            ),
            params![object_id.to_string(), principal.id.as_str(), session_id.as_str()],
        )?;
        match lock {
            Some(lock) if self.is_expired(&lock) => {
                let removed = self.store.connection().execute(
                    "DELETE FROM object_locks
                     WHERE object_id = ?1 AND lock_type = 'optimistic'
                       AND user_id = ?2 AND session_id = ?3;",
                    params![object_id.to_string(), principal.id, session_id],
                );
                match removed {
                    Ok(removed) => warn!(
                        "event=lock_expire module=lock status=ok object_id={object_id} lock_type=optimistic removed={removed}"
                    ),
                    Err(err) => error!(
                        "event=lock_expire module=lock status=error object_id={object_id} lock_type=optimistic error={err}"
                    ),
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Replaces the snapshot stored with the current optimistic lock.
    pub fn refresh_snapshot(&self, object_id: &EntityId, snapshot: &str) -> LockResult<bool> {
        let Some(principal) = self.session.current_principal() else {
            return Ok(false);
        };
        let changed = self.store.connection().execute(
            "UPDATE object_locks SET snapshot = ?1
             WHERE object_id = ?2 AND lock_type = 'optimistic'
               AND user_id = ?3 AND session_id = ?4;",
            params![
                snapshot,
                object_id.to_string(),
                principal.id,
                self.session.current_session_id()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Releases the current principal's locks on `object_id`.
    pub fn release_lock(&self, object_id: &EntityId) -> LockResult<usize> {
        let Some(principal) = self.session.current_principal() else {
            return Ok(0);
        };
        let removed = self.store.connection().execute(
            "DELETE FROM object_locks WHERE object_id = ?1 AND user_id = ?2;",
            params![object_id.to_string(), principal.id],
        )?;
        info!("event=lock_release module=lock status=ok object_id={object_id} removed={removed}");
        Ok(removed)
    }

    /// Releases every holder's locks on `object_id`.
    pub fn release_locks(&self, object_id: &EntityId) -> LockResult<usize> {
        let removed = self.store.connection().execute(
            "DELETE FROM object_locks WHERE object_id = ?1;",
            params![object_id.to_string()],
        )?;
        info!("event=lock_release_all_holders module=lock status=ok object_id={object_id} removed={removed}");
        Ok(removed)
    }

    /// Releases every lock held by the current principal.
    pub fn release_all_locks(&self) -> LockResult<usize> {
        let Some(principal) = self.session.current_principal() else {
            return Ok(0);
        };
        let removed = self.store.connection().execute(
            "DELETE FROM object_locks WHERE user_id = ?1;",
            params![principal.id],
        )?;
        info!(
            "event=lock_release_principal module=lock status=ok login={} removed={removed}",
            principal.login
        );
        Ok(removed)
    }

    /// Couples authorization with pessimistic lock acquisition.
    ///
    /// Never fails for viewing: conflicts and missing rights produce
    /// `EditAccess::ReadOnly` with a message.
    pub fn check_edit_access(
        &self,
        object_id: &EntityId,
        context: &str,
        authorizer: &dyn Authorizer,
    ) -> LockResult<EditAccess> {
        let Some(principal) = self.session.current_principal() else {
            return Ok(EditAccess::NoPrincipal);
        };
        if !authorizer.authorize(&object_id.to_string(), context, Action::Update, Some(&principal)) {
            return Ok(EditAccess::ReadOnly {
                message: format!("You are not allowed to edit {object_id}."),
                holder: None,
            });
        }
        match self.acquire_lock(object_id)? {
            Some(lock) if lock.is_held_by(&principal.id) => Ok(EditAccess::Granted(lock)),
            Some(lock) => Ok(EditAccess::ReadOnly {
                message: format!(
                    "{object_id} is locked by user '{}'. Your changes will not be saved.",
                    lock.holder_login
                ),
                holder: Some(lock),
            }),
            None => Ok(EditAccess::NoPrincipal),
        }
    }

    fn is_expired(&self, lock: &Lock) -> bool {
        let lifetime_ms = self.session.session_lifetime_seconds().saturating_mul(1000);
        self.clock.now_millis() - lock.created_at > lifetime_ms
    }

    fn expire(&self, object_id: &EntityId) {
        match self.release_locks(object_id) {
            Ok(removed) => warn!(
                "event=lock_expire module=lock status=ok object_id={object_id} removed={removed}"
            ),
            Err(err) => error!(
                "event=lock_expire module=lock status=error object_id={object_id} error={err}"
            ),
        }
    }

    fn select_one(&self, sql: &str, values: impl Params) -> LockResult<Option<Lock>> {
        let row = self
            .store
            .connection()
            .query_row(sql, values, parse_lock_row)
            .optional()?;
        Ok(row.flatten())
    }
}

/// Rows with an unparsable id or type are ignored rather than failing reads.
fn parse_lock_row(row: &Row<'_>) -> rusqlite::Result<Option<Lock>> {
    let object_id: String = row.get(0)?;
    let lock_type: String = row.get(1)?;
    let (Ok(object_id), Some(lock_type)) =
        (EntityId::try_from(object_id), LockType::parse(&lock_type))
    else {
        return Ok(None);
    };
    Ok(Some(Lock {
        object_id,
        lock_type,
        holder_user_id: row.get(2)?,
        holder_login: row.get(3)?,
        session_id: row.get(4)?,
        created_at: row.get(5)?,
        snapshot: row.get(6)?,
    }))
}

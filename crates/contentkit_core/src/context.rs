//! Session, authorization and clock collaborators.
//!
//! # Responsibility
//! - Describe what the persistence core consumes from the hosting
//!   application: the current principal, the session, authorization
//!   decisions and time.
//!
//! # Invariants
//! - The core never decides policy; it only asks `Authorizer`.
//! - Lock expiry reads time from `Clock` only.

use std::cell::{Cell, RefCell};
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

/// Authenticated user stamped on locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub login: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
        }
    }
}

/// Session facts consulted by the lock manager and authorization.
pub trait SessionContext {
    fn current_principal(&self) -> Option<Principal>;

    fn current_session_id(&self) -> String;

    fn session_lifetime_seconds(&self) -> i64;
}

/// Settable in-process session, used by the CLI and tests.
#[derive(Debug)]
pub struct StaticSession {
    principal: RefCell<Option<Principal>>,
    session_id: RefCell<String>,
    lifetime_seconds: Cell<i64>,
}

impl StaticSession {
    pub fn new(principal: Option<Principal>, session_id: impl Into<String>, lifetime_seconds: i64) -> Self {
        Self {
            principal: RefCell::new(principal),
            session_id: RefCell::new(session_id.into()),
            lifetime_seconds: Cell::new(lifetime_seconds),
        }
    }

    /// Session without a principal.
    pub fn anonymous(lifetime_seconds: i64) -> Self {
        Self::new(None, "anonymous", lifetime_seconds)
    }

    /// Switches the acting principal and session.
    pub fn switch_to(&self, principal: Option<Principal>, session_id: impl Into<String>) {
        *self.principal.borrow_mut() = principal;
        *self.session_id.borrow_mut() = session_id.into();
    }

    pub fn set_lifetime_seconds(&self, seconds: i64) {
        self.lifetime_seconds.set(seconds);
    }
}

impl SessionContext for StaticSession {
    fn current_principal(&self) -> Option<Principal> {
        self.principal.borrow().clone()
    }

    fn current_session_id(&self) -> String {
        self.session_id.borrow().clone()
    }

    fn session_lifetime_seconds(&self) -> i64 {
        self.lifetime_seconds.get()
    }
}

/// Millisecond wall clock.
pub trait Clock {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

/// Clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<i64>,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: Cell::new(start_millis),
        }
    }

    pub fn advance_secs(&self, seconds: i64) {
        self.now.set(self.now.get() + seconds * 1000);
    }

    pub fn set_millis(&self, millis: i64) {
        self.now.set(millis);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.get()
    }
}

/// Operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy decision point.
///
/// `resource` is a serialized id or a type name; `context` names the
/// calling application context.
pub trait Authorizer {
    fn authorize(
        &self,
        resource: &str,
        context: &str,
        action: Action,
        principal: Option<&Principal>,
    ) -> bool;
}

/// Grants every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _: &str, _: &str, _: Action, _: Option<&Principal>) -> bool {
        true
    }
}

impl<F> Authorizer for F
where
    F: Fn(&str, &str, Action, Option<&Principal>) -> bool,
{
    fn authorize(
        &self,
        resource: &str,
        context: &str,
        action: Action,
        principal: Option<&Principal>,
    ) -> bool {
        self(resource, context, action, principal)
    }
}

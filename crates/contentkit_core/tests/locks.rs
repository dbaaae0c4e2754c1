use contentkit_core::{
    Action, AllowAll, EditAccess, EntityId, LockManager, LockType, ManualClock, Principal,
    SqliteStore, StaticSession,
};
use std::rc::Rc;

const LIFETIME_SECONDS: i64 = 3_600;

struct Fixture {
    store: Rc<SqliteStore>,
    session: Rc<StaticSession>,
    clock: Rc<ManualClock>,
    locks: LockManager,
}

fn fixture() -> Fixture {
    let store = Rc::new(SqliteStore::open_in_memory().unwrap());
    let session = Rc::new(StaticSession::new(
        Some(Principal::new("a", "alice")),
        "session-a",
        LIFETIME_SECONDS,
    ));
    let clock = Rc::new(ManualClock::new(1_700_000_000_000));
    let locks = LockManager::new(store.clone(), session.clone(), clock.clone());
    Fixture {
        store,
        session,
        clock,
        locks,
    }
}

fn foo() -> EntityId {
    EntityId::new("Foo", ["1"]).unwrap()
}

fn lock_rows(store: &SqliteStore) -> i64 {
    store
        .connection()
        .query_row("SELECT COUNT(*) FROM object_locks;", [], |row| row.get(0))
        .unwrap()
}

fn switch_to_bob(session: &StaticSession) {
    session.switch_to(Some(Principal::new("b", "bob")), "session-b");
}

#[test]
fn pessimistic_lock_is_reported_to_other_users_until_it_expires() {
    let fx = fixture();
    let acquired = fx.locks.acquire_lock(&foo()).unwrap().unwrap();
    assert_eq!(acquired.holder_login, "alice");

    switch_to_bob(&fx.session);
    let seen_by_bob = fx.locks.acquire_lock(&foo()).unwrap().unwrap();
    assert!(!seen_by_bob.is_held_by("b"));
    assert_eq!(seen_by_bob.holder_login, "alice");
    assert_eq!(fx.locks.get_lock(&foo()).unwrap().unwrap().holder_user_id, "a");
    assert_eq!(lock_rows(&fx.store), 1);

    fx.clock.advance_secs(LIFETIME_SECONDS + 1);
    assert!(fx.locks.get_lock(&foo()).unwrap().is_none());
    assert_eq!(lock_rows(&fx.store), 0);
}

#[test]
fn lock_at_exact_lifetime_is_still_valid() {
    let fx = fixture();
    fx.locks.acquire_lock(&foo()).unwrap();
    fx.clock.advance_secs(LIFETIME_SECONDS);
    assert!(fx.locks.get_lock(&foo()).unwrap().is_some());
}

#[test]
fn acquiring_own_lock_twice_keeps_one_row() {
    let fx = fixture();
    let first = fx.locks.acquire_lock(&foo()).unwrap().unwrap();
    fx.clock.advance_secs(10);
    let second = fx.locks.acquire_lock(&foo()).unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(lock_rows(&fx.store), 1);
}

#[test]
fn release_is_idempotent_and_scoped_to_the_principal() {
    let fx = fixture();
    fx.locks.acquire_lock(&foo()).unwrap();

    switch_to_bob(&fx.session);
    assert_eq!(fx.locks.release_lock(&foo()).unwrap(), 0);
    assert_eq!(lock_rows(&fx.store), 1);

    fx.session
        .switch_to(Some(Principal::new("a", "alice")), "session-a");
    assert_eq!(fx.locks.release_lock(&foo()).unwrap(), 1);
    assert_eq!(fx.locks.release_lock(&foo()).unwrap(), 0);
    assert!(fx.locks.get_lock(&foo()).unwrap().is_none());
}

#[test]
fn release_all_locks_drops_every_lock_of_the_principal() {
    let fx = fixture();
    let other = EntityId::new("Foo", ["2"]).unwrap();
    fx.locks.acquire_lock(&foo()).unwrap();
    fx.locks
        .acquire(&other, LockType::Optimistic, Some("{}".to_string()))
        .unwrap();
    switch_to_bob(&fx.session);
    fx.locks
        .acquire(&other, LockType::Optimistic, Some("{}".to_string()))
        .unwrap();

    fx.session
        .switch_to(Some(Principal::new("a", "alice")), "session-a");
    assert_eq!(fx.locks.release_all_locks().unwrap(), 2);
    assert_eq!(lock_rows(&fx.store), 1);
    assert_eq!(fx.locks.release_locks(&other).unwrap(), 1);
}

#[test]
fn anonymous_sessions_get_no_locks() {
    let fx = fixture();
    fx.session.switch_to(None, "anonymous");

    assert!(fx.locks.acquire_lock(&foo()).unwrap().is_none());
    assert_eq!(lock_rows(&fx.store), 0);
    assert!(matches!(
        fx.locks.check_edit_access(&foo(), "default", &AllowAll).unwrap(),
        EditAccess::NoPrincipal
    ));
}

#[test]
fn optimistic_locks_keep_one_snapshot_per_session() {
    let fx = fixture();
    fx.locks
        .acquire(&foo(), LockType::Optimistic, Some("first".to_string()))
        .unwrap();
    fx.locks
        .acquire(&foo(), LockType::Optimistic, Some("second".to_string()))
        .unwrap();
    assert_eq!(lock_rows(&fx.store), 1);

    let lock = fx.locks.get_optimistic_lock(&foo()).unwrap().unwrap();
    assert_eq!(lock.snapshot.as_deref(), Some("second"));
    assert!(fx.locks.get_lock(&foo()).unwrap().is_none());

    assert!(fx.locks.refresh_snapshot(&foo(), "third").unwrap());
    let refreshed = fx.locks.get_optimistic_lock(&foo()).unwrap().unwrap();
    assert_eq!(refreshed.snapshot.as_deref(), Some("third"));

    switch_to_bob(&fx.session);
    assert!(fx.locks.get_optimistic_lock(&foo()).unwrap().is_none());
    assert!(!fx.locks.refresh_snapshot(&foo(), "bob").unwrap());
}

#[test]
fn expired_optimistic_lock_is_dropped() {
    let fx = fixture();
    fx.locks
        .acquire(&foo(), LockType::Optimistic, Some("old".to_string()))
        .unwrap();
    fx.clock.advance_secs(LIFETIME_SECONDS + 60);

    assert!(fx.locks.get_optimistic_lock(&foo()).unwrap().is_none());
    assert_eq!(lock_rows(&fx.store), 0);
}

#[test]
fn failed_expiry_cleanup_does_not_fail_the_read() {
    let fx = fixture();
    fx.locks
        .acquire(&foo(), LockType::Optimistic, Some("old".to_string()))
        .unwrap();
    fx.store
        .connection()
        .execute_batch(
            "CREATE TRIGGER keep_locks BEFORE DELETE ON object_locks
             BEGIN SELECT RAISE(ABORT, 'locks are pinned'); END;",
        )
        .unwrap();
    fx.clock.advance_secs(LIFETIME_SECONDS + 60);

    assert!(fx.locks.get_optimistic_lock(&foo()).unwrap().is_none());
    assert!(fx.locks.get_lock(&foo()).unwrap().is_none());
    assert_eq!(lock_rows(&fx.store), 1);
}

#[test]
fn edit_access_reports_holder_or_missing_rights() {
    let fx = fixture();
    match fx.locks.check_edit_access(&foo(), "default", &AllowAll).unwrap() {
        EditAccess::Granted(lock) => assert_eq!(lock.holder_login, "alice"),
        other => panic!("unexpected access: {other:?}"),
    }

    switch_to_bob(&fx.session);
    match fx.locks.check_edit_access(&foo(), "default", &AllowAll).unwrap() {
        EditAccess::ReadOnly { message, holder } => {
            assert!(message.contains("alice"));
            assert_eq!(holder.unwrap().holder_user_id, "a");
        }
        other => panic!("unexpected access: {other:?}"),
    }

    let read_only = |_: &str, _: &str, action: Action, _: Option<&Principal>| action == Action::Read;
    let other = EntityId::new("Foo", ["9"]).unwrap();
    match fx.locks.check_edit_access(&other, "default", &read_only).unwrap() {
        EditAccess::ReadOnly { holder, .. } => assert!(holder.is_none()),
        other => panic!("unexpected access: {other:?}"),
    }
    assert!(fx.locks.get_lock(&other).unwrap().is_none());
}

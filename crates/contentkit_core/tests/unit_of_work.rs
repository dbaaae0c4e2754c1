use contentkit_core::model::id::provisional_component;
use contentkit_core::{
    CommitTarget, Entity, EntityId, EntityRef, EntityState, PersistenceError, PersistenceResult,
    Transaction, TransactionStatus, Value,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Commit target that records operations and assigns sequential keys.
#[derive(Default)]
struct MemoryTarget {
    log: RefCell<Vec<String>>,
    next_key: Cell<u32>,
    fail_on_type: Option<&'static str>,
    /// Entity touched after the keyed entity is written.
    cascade: RefCell<HashMap<String, EntityRef>>,
    rolled_back: Cell<bool>,
}

impl MemoryTarget {
    fn failing_on(type_name: &'static str) -> Self {
        Self {
            fail_on_type: Some(type_name),
            ..Self::default()
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }
}

impl CommitTarget for MemoryTarget {
    fn begin(&self) -> PersistenceResult<()> {
        self.log.borrow_mut().push("begin".to_string());
        Ok(())
    }

    fn commit(&self) -> PersistenceResult<()> {
        self.log.borrow_mut().push("commit".to_string());
        Ok(())
    }

    fn rollback(&self) -> PersistenceResult<()> {
        self.rolled_back.set(true);
        Ok(())
    }

    fn persist(&self, entity: &mut Entity) -> PersistenceResult<()> {
        if self.fail_on_type == Some(entity.type_name()) {
            return Err(PersistenceError::InvalidData(format!("refusing {}", entity.id())));
        }
        let verb = if entity.is_new() { "insert" } else { "update" };
        if entity.id().is_provisional() {
            self.next_key.set(self.next_key.get() + 1);
            let key = self.next_key.get().to_string();
            entity.replace_id(EntityId::new(entity.type_name(), [key])?)?;
        }
        entity.mark_clean();
        let entry = format!("{verb} {}", entity.id());
        self.log.borrow_mut().push(entry);

        let partner = self.cascade.borrow().get(&entity.id().to_string()).cloned();
        if let Some(partner) = partner {
            let stamp = format!("touched by {} #{}", entity.id(), self.log.borrow().len());
            partner.borrow_mut().set_value("name", stamp)?;
        }
        Ok(())
    }

    fn remove(&self, entity: &mut Entity) -> PersistenceResult<()> {
        let entry = format!("delete {}", entity.id());
        self.log.borrow_mut().push(entry);
        Ok(())
    }
}

fn key_of(id: &str) -> EntityId {
    let (type_name, key) = id.split_once(':').unwrap();
    EntityId::new(type_name, [key]).unwrap()
}

fn loaded(id: &str, name: &str) -> Entity {
    let mut entity = Entity::new(key_of(id), vec!["id".to_string()], EntityState::Clean);
    entity.load_value("name", Value::from(name));
    entity
}

fn fresh(type_name: &str) -> Entity {
    let id = EntityId::new(type_name, [provisional_component()]).unwrap();
    Entity::new(id, vec!["id".to_string()], EntityState::New)
}

#[test]
fn registering_same_id_twice_returns_same_instance_with_merged_values() {
    let transaction = Transaction::default();
    transaction.begin();

    let first = transaction.register_loaded(loaded("Author:1", "Ingo"));
    let mut second_copy = Entity::new(key_of("Author:1"), vec!["id".to_string()], EntityState::Clean);
    second_copy.load_value("email", Value::from("ingo@example.org"));
    let second = transaction.register_loaded(second_copy);

    assert!(Rc::ptr_eq(&first, &second));
    let entity = second.borrow();
    assert_eq!(entity.value("name"), Some(&Value::from("Ingo")));
    assert_eq!(entity.value("email"), Some(&Value::from("ingo@example.org")));
}

#[test]
fn value_changes_queue_loaded_entities_as_dirty() {
    let transaction = Transaction::default();
    transaction.begin();
    let author = transaction.register_loaded(loaded("Author:1", "Ingo"));

    author.borrow_mut().set_value("name", "Inga").unwrap();

    assert_eq!(author.borrow().state(), EntityState::Dirty);
    assert_eq!(transaction.pending_dirty(), ["Author:1"]);
}

#[test]
fn new_entities_stay_new_and_deleted_is_final() {
    let transaction = Transaction::default();
    transaction.begin();
    let draft = transaction.register_new(fresh("Recipe").into_ref());

    draft.borrow_mut().set_value("name", "Soup").unwrap();
    assert_eq!(draft.borrow().state(), EntityState::New);
    assert_eq!(transaction.pending_new().len(), 1);

    draft.borrow_mut().delete();
    draft.borrow_mut().set_state(EntityState::Dirty);
    draft.borrow_mut().mark_clean();
    assert_eq!(draft.borrow().state(), EntityState::Deleted);
    assert!(transaction.pending_new().is_empty());
    assert!(transaction.pending_deleted().is_empty());
}

#[test]
fn deleting_an_unsaved_draft_never_reaches_the_target() {
    let transaction = Transaction::default();
    transaction.begin();
    let draft = transaction.register_new(fresh("Recipe").into_ref());
    draft.borrow_mut().delete();
    transaction.register_deleted(draft.clone());

    let target = MemoryTarget::default();
    transaction.commit(&target).unwrap();

    assert_eq!(target.log(), ["begin", "commit"]);
}

#[test]
fn commit_inserts_parents_first_and_rewrites_references() {
    let transaction = Transaction::default();
    transaction.begin();
    let author = fresh("Author").into_ref();
    let provisional_author = author.borrow().id().clone();
    let recipe = transaction.register_new(fresh("Recipe").into_ref());
    recipe
        .borrow_mut()
        .set_reference("Author", Some(provisional_author.clone()))
        .unwrap();
    transaction.register_new(author.clone());

    let target = MemoryTarget::default();
    transaction.commit(&target).unwrap();

    assert_eq!(
        target.log(),
        ["begin", "insert Author:1", "insert Recipe:2", "commit"]
    );
    assert_eq!(recipe.borrow().reference("Author"), Some(&key_of("Author:1")));
    assert_eq!(author.borrow().state(), EntityState::Clean);
    assert_eq!(transaction.status(), TransactionStatus::Inactive);
    assert!(transaction.tracked().is_empty());
}

#[test]
fn commit_processes_entities_dirtied_while_saving() {
    let transaction = Transaction::default();
    transaction.begin();
    let author = transaction.register_loaded(loaded("Author:1", "Ingo"));
    let recipe = transaction.register_loaded(loaded("Recipe:5", "Soup"));
    author.borrow_mut().set_value("name", "Inga").unwrap();

    let target = MemoryTarget::default();
    target
        .cascade
        .borrow_mut()
        .insert("Author:1".to_string(), recipe.clone());
    transaction.commit(&target).unwrap();

    assert_eq!(
        target.log(),
        ["begin", "update Author:1", "update Recipe:5", "commit"]
    );
    assert_eq!(recipe.borrow().state(), EntityState::Clean);
}

#[test]
fn endless_cascade_is_cut_off() {
    let transaction = Transaction::new(3);
    transaction.begin();
    let author = transaction.register_loaded(loaded("Author:1", "Ingo"));
    let recipe = transaction.register_loaded(loaded("Recipe:5", "Soup"));
    author.borrow_mut().set_value("name", "Inga").unwrap();

    let target = MemoryTarget::default();
    target
        .cascade
        .borrow_mut()
        .insert("Author:1".to_string(), recipe.clone());
    target
        .cascade
        .borrow_mut()
        .insert("Recipe:5".to_string(), author.clone());

    let err = transaction.commit(&target).unwrap_err();
    assert!(matches!(err, PersistenceError::CommitCascadeLimit { rounds: 3 }));
    assert!(target.rolled_back.get());
}

#[test]
fn failed_commit_rolls_back_and_clears_registries() {
    let transaction = Transaction::default();
    transaction.begin();
    transaction.register_new(fresh("Author").into_ref());
    transaction.register_new(fresh("Recipe").into_ref());

    let target = MemoryTarget::failing_on("Recipe");
    let err = transaction.commit(&target).unwrap_err();

    assert!(matches!(err, PersistenceError::InvalidData(_)));
    assert!(target.rolled_back.get());
    assert!(!target.log().contains(&"commit".to_string()));
    assert!(transaction.tracked().is_empty());
    assert!(!transaction.is_active());
}

#[test]
fn failed_commit_restores_ids_and_states_for_a_retry() {
    let transaction = Transaction::default();
    transaction.begin();
    let author = transaction.register_new(fresh("Author").into_ref());
    let provisional_author = author.borrow().id().clone();
    let recipe = transaction.register_new(fresh("Recipe").into_ref());
    recipe
        .borrow_mut()
        .set_reference("Author", Some(provisional_author.clone()))
        .unwrap();

    let failing = MemoryTarget::failing_on("Recipe");
    transaction.commit(&failing).unwrap_err();
    assert!(failing.log().contains(&"insert Author:1".to_string()));

    assert_eq!(author.borrow().id(), &provisional_author);
    assert_eq!(author.borrow().state(), EntityState::New);
    assert_eq!(recipe.borrow().reference("Author"), Some(&provisional_author));
    assert_eq!(recipe.borrow().state(), EntityState::New);
    assert_eq!(author.borrow().observer_count(), 0);

    transaction.begin();
    transaction.register_new(author.clone());
    transaction.register_new(recipe.clone());
    let target = MemoryTarget::default();
    transaction.commit(&target).unwrap();

    assert_eq!(
        target.log(),
        ["begin", "insert Author:1", "insert Recipe:2", "commit"]
    );
    assert_eq!(recipe.borrow().reference("Author"), Some(&key_of("Author:1")));
}

#[test]
fn commit_without_begin_is_rejected() {
    let transaction = Transaction::default();
    let err = transaction.commit(&MemoryTarget::default()).unwrap_err();
    assert!(matches!(err, PersistenceError::TransactionNotActive));
}

#[test]
fn deletes_run_after_updates() {
    let transaction = Transaction::default();
    transaction.begin();
    let author = transaction.register_loaded(loaded("Author:1", "Ingo"));
    let recipe = transaction.register_loaded(loaded("Recipe:5", "Soup"));
    author.borrow_mut().delete();
    recipe.borrow_mut().set_value("name", "Stew").unwrap();

    let target = MemoryTarget::default();
    transaction.commit(&target).unwrap();

    assert_eq!(
        target.log(),
        ["begin", "update Recipe:5", "delete Author:1", "commit"]
    );
}

#[test]
fn key_assignment_rekeys_identity_map() {
    let transaction = Transaction::default();
    transaction.begin();
    let draft = Entity::new(
        EntityId::new("RecipeNote", [provisional_component(), provisional_component()]).unwrap(),
        vec!["recipe_id".to_string(), "language".to_string()],
        EntityState::New,
    );
    let note = transaction.register_new(draft.into_ref());

    note.borrow_mut().set_value("recipe_id", 7).unwrap();
    note.borrow_mut().set_value("language", "de").unwrap();

    let id = key_of_note("RecipeNote:7:de");
    assert_eq!(note.borrow().id(), &id);
    assert!(transaction.get(&id).is_some());
    assert_eq!(transaction.pending_new(), ["RecipeNote:7:de"]);
}

#[test]
fn rollback_discards_everything() {
    let transaction = Transaction::default();
    transaction.begin();
    let author = transaction.register_loaded(loaded("Author:1", "Ingo"));
    author.borrow_mut().set_value("name", "Inga").unwrap();

    transaction.rollback();

    assert!(!transaction.is_active());
    assert!(transaction.pending_dirty().is_empty());
    assert!(transaction.get(&key_of("Author:1")).is_none());
    assert_eq!(author.borrow().observer_count(), 0);
}

fn key_of_note(serialized: &str) -> EntityId {
    let parts = serialized.split(':').collect::<Vec<_>>();
    EntityId::new(parts[0], parts[1..].iter().copied()).unwrap()
}

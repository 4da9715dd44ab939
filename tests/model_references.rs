use std::sync::Arc;

use metable::{Database, EntityType, MetableError, PersistenceMode, TypeTag, Value};

fn setup() -> Database {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch(
        "
        create table users (id integer primary key autoincrement, name text);
        create table posts (id integer primary key autoincrement, title text);
        ",
    )
    .expect("tables");
    db.register(EntityType::new("users")).expect("users");
    db.register(EntityType::new("posts")).expect("posts");
    db.migrate("users").expect("migrate users");
    db.migrate("posts").expect("migrate posts");
    db
}

fn saved_post(db: &Database, title: &str) -> metable::Entity {
    let mut post = db.make("posts").unwrap();
    post.set("title", title).unwrap();
    post.save().unwrap();
    post
}

#[test]
fn references_are_stored_as_type_and_id() {
    let db = setup();
    let post = saved_post(&db, "Hello");
    let post_id = post.id().unwrap();
    let mut user = db.make("users").unwrap();
    user.set("favourite", post).unwrap();
    user.save().unwrap();

    let user = db.find_or_fail("users", user.id().unwrap()).unwrap();
    let record = user.meta_record("favourite").unwrap().unwrap();
    assert_eq!(record.type_tag(), TypeTag::Model);
    assert_eq!(record.raw_value(), Some(format!("posts#{}", post_id).as_str()));

    let first = user.get("favourite").unwrap();
    let first = first.as_model().unwrap();
    assert_eq!(first.id(), Some(post_id));
    assert_eq!(first.get("title").unwrap(), Value::from("Hello"));
    // served from the reference cache the second time
    let second = user.get("favourite").unwrap();
    assert!(Arc::ptr_eq(first, second.as_model().unwrap()));
}

#[test]
fn missing_targets_surface_as_not_found() {
    let db = setup();
    let mut post = saved_post(&db, "Short lived");
    let mut user = db.make("users").unwrap();
    user.set_meta("favourite", db.find_or_fail("posts", post.id().unwrap()).unwrap())
        .unwrap();
    user.save().unwrap();
    post.delete().unwrap();

    let user = db.find_or_fail("users", user.id().unwrap()).unwrap();
    let err = user.get("favourite").unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn cached_references_can_be_forgotten() {
    let db = setup();
    let post = saved_post(&db, "Cached");
    let post_id = post.id().unwrap();
    let mut user = db.make("users").unwrap();
    user.set("favourite", post).unwrap();
    user.save().unwrap();

    let user = db.find_or_fail("users", user.id().unwrap()).unwrap();
    assert!(user.get("favourite").unwrap().as_model().is_some());

    db.find_or_fail("posts", post_id).unwrap().delete().unwrap();
    // still cached
    assert!(user.get("favourite").is_ok());
    assert!(user.forget_reference("posts", post_id).unwrap());
    assert!(user.get("favourite").unwrap_err().is_not_found());
}

#[test]
fn unsaved_references_keep_only_the_type() {
    let db = setup();
    let mut user = db.make("users").unwrap();
    user.set("draft", db.make("posts").unwrap()).unwrap();
    user.save().unwrap();

    let user = db.find_or_fail("users", user.id().unwrap()).unwrap();
    assert_eq!(user.meta_record("draft").unwrap().unwrap().raw_value(), Some("posts"));
    let draft = user.get("draft").unwrap();
    let draft = draft.as_model().unwrap();
    assert_eq!(draft.type_name(), "posts");
    assert!(draft.id().is_none());
}

#[test]
fn unregistered_types_are_rejected_at_set_time() {
    let db = setup();
    let other = Database::new(PersistenceMode::InMemory).unwrap();
    other
        .execute_batch("create table comments (id integer primary key autoincrement);")
        .unwrap();
    other.register(EntityType::new("comments")).unwrap();
    let comment = other.make("comments").unwrap();

    let mut user = db.make("users").unwrap();
    let err = user.set("comment", comment).unwrap_err();
    assert!(matches!(err, MetableError::InvalidReference(_)));
    assert!(!user.has_meta("comment").unwrap());
}

#[test]
fn setting_a_reference_again_returns_the_new_instance() {
    let db = setup();
    let post = saved_post(&db, "Old");
    let post_id = post.id().unwrap();
    let mut user = db.make("users").unwrap();
    user.set("favourite", db.find_or_fail("posts", post_id).unwrap()).unwrap();
    assert_eq!(
        user.get("favourite").unwrap().as_model().unwrap().get("title").unwrap(),
        Value::from("Old")
    );

    let mut renamed = db.find_or_fail("posts", post_id).unwrap();
    renamed.set("title", "New").unwrap();
    let renamed = Arc::new(renamed);
    user.set("favourite", Arc::clone(&renamed)).unwrap();

    let current = user.get("favourite").unwrap();
    let current = current.as_model().unwrap();
    assert!(Arc::ptr_eq(current, &renamed));
    assert_eq!(current.get("title").unwrap(), Value::from("New"));
}

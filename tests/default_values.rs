use metable::{Database, EntityType, FlushStatus, PersistenceMode, Value};

fn setup() -> Database {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch("create table users (id integer primary key autoincrement, name text);")
        .expect("users table");
    db.register(
        EntityType::new("users")
            .with_default("color", "red")
            .with_default("level", 0),
    )
    .expect("register");
    db.migrate("users").expect("migrate");
    db
}

fn stored_keys(db: &Database, id: i64) -> Vec<String> {
    let schema = db.entity_type("users").unwrap();
    db.meta_rows(&schema, id)
        .unwrap()
        .into_iter()
        .map(|row| row.key)
        .collect()
}

#[test]
fn defaults_are_read_without_a_record() {
    let db = setup();
    let user = db.make("users").unwrap();
    assert_eq!(user.get("color").unwrap(), Value::from("red"));
    assert!(user.isset("color").unwrap());
    assert!(!user.has_meta("color").unwrap());
}

#[test]
fn setting_the_default_stores_nothing() {
    let db = setup();
    let mut user = db.make("users").unwrap();
    user.set("color", "red").unwrap();
    let report = user.save().unwrap();
    assert!(report.metas.is_empty());
    assert!(stored_keys(&db, user.id().unwrap()).is_empty());
    assert_eq!(user.get("color").unwrap(), Value::from("red"));
}

#[test]
fn returning_to_the_default_deletes_the_override() {
    let db = setup();
    let mut user = db.make("users").unwrap();
    user.set("color", "blue").unwrap();
    user.save().unwrap();
    let id = user.id().unwrap();
    assert_eq!(stored_keys(&db, id), vec!["color"]);

    let mut user = db.find_or_fail("users", id).unwrap();
    assert_eq!(user.get("color").unwrap(), Value::from("blue"));
    user.set("color", "red").unwrap();
    let report = user.save().unwrap();
    assert!(matches!(report.outcome("color").unwrap().status, FlushStatus::Deleted));
    assert!(stored_keys(&db, id).is_empty());
    assert_eq!(user.get("color").unwrap(), Value::from("red"));
}

#[test]
fn default_comparison_is_strict() {
    let db = setup();
    let mut user = db.make("users").unwrap();
    user.set("level", "0").unwrap();
    assert!(user.has_meta("level").unwrap());
    assert_eq!(user.get("level").unwrap(), Value::from("0"));
    user.set("level", 0).unwrap();
    assert!(!user.has_meta("level").unwrap());
    assert_eq!(user.get("level").unwrap(), Value::from(0));
}

#[test]
fn set_twice_then_unset_leaves_no_row() {
    let db = setup();
    let mut user = db.make("users").unwrap();
    user.set("n", 1).unwrap();
    user.set("n", 2).unwrap();
    user.unset("n").unwrap();
    let report = user.save().unwrap();
    assert!(matches!(report.outcome("n").unwrap().status, FlushStatus::Deleted));
    assert!(stored_keys(&db, user.id().unwrap()).is_empty());
    assert_eq!(user.get("n").unwrap(), Value::Null);
}

#[test]
fn unset_falls_back_to_the_default() {
    let db = setup();
    let mut user = db.make("users").unwrap();
    user.set("color", "green").unwrap();
    user.unset("color").unwrap();
    assert_eq!(user.get("color").unwrap(), Value::from("red"));
}

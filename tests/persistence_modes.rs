use metable::{Database, EntityType, PersistenceMode, Value};

fn open(mode: PersistenceMode) -> Database {
    let db = Database::new(mode).expect("db");
    db.execute_batch(
        "create table if not exists users (id integer primary key autoincrement, name text);",
    )
    .expect("users table");
    db.register(EntityType::new("users")).expect("register");
    db.migrate("users").expect("migrate");
    db
}

#[test]
fn in_memory_mode_allows_basic_operations() {
    let db = open(PersistenceMode::InMemory);
    let mut user = db.make("users").unwrap();
    user.set("name", "Ada").unwrap();
    user.set("title", "Countess").unwrap();
    let report = user.save().unwrap();
    assert!(report.created);
    assert_eq!(report.failures().count(), 0);

    // a second in-memory database shares nothing with the first
    let fresh = open(PersistenceMode::InMemory);
    assert!(fresh.find("users", user.id().unwrap()).unwrap().is_none());
}

#[test]
fn file_mode_survives_reopening() {
    let path = std::env::temp_dir()
        .join("metable_persistence_modes.db")
        .to_string_lossy()
        .into_owned();
    // Ensure clean start
    let _ = std::fs::remove_file(&path);

    let id = {
        let db = open(PersistenceMode::File(path.clone()));
        let mut user = db.make("users").unwrap();
        user.set("name", "Grace").unwrap();
        user.set_metas([("rank", Value::from("admiral")), ("born", Value::from(1906))])
            .unwrap();
        user.save().unwrap();
        user.id().unwrap()
    };

    let db = open(PersistenceMode::File(path.clone()));
    let user = db.find_or_fail("users", id).unwrap();
    assert_eq!(user.get("name").unwrap(), Value::from("Grace"));
    assert_eq!(user.get("rank").unwrap(), Value::from("admiral"));
    assert_eq!(user.get("born").unwrap(), Value::from(1906));
    drop(user);
    drop(db);
    // Clean up
    let _ = std::fs::remove_file(&path);
}

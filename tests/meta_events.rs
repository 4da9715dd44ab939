use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use metable::{
    AggregateEvent, Database, Entity, EntityType, FlushStatus, MetaEvent, MetaObserver,
    MetaRecord, PersistenceMode, Value, Verdict,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    log: Log,
}

impl Recorder {
    fn record(&self, event: &str, meta: &MetaRecord) -> Verdict {
        self.log.lock().unwrap().push(format!("observer:{}:{}", event, meta.key()));
        Verdict::Continue
    }
}

impl MetaObserver for Recorder {
    fn meta_creating(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaCreating", meta)
    }
    fn meta_created(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaCreated", meta)
    }
    fn meta_saving(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaSaving", meta)
    }
    fn meta_saved(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaSaved", meta)
    }
    fn meta_updating(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaUpdating", meta)
    }
    fn meta_updated(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaUpdated", meta)
    }
    fn meta_deleting(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaDeleting", meta)
    }
    fn meta_deleted(&self, _entity: &Entity, meta: &MetaRecord) -> Verdict {
        self.record("metaDeleted", meta)
    }
    fn saved_with_metas(&self, _entity: &Entity) {
        self.log.lock().unwrap().push("observer:savedWithMetas".to_owned());
    }
}

/// Records every event through all three handler tiers.
fn recording_setup() -> (Database, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch("create table users (id integer primary key autoincrement, name text);")
        .expect("users table");

    let mut users = EntityType::new("users").with_observer(Recorder { log: Arc::clone(&log) });
    for event in MetaEvent::ALL {
        let log = Arc::clone(&log);
        users = users.on_meta(event, move |_, meta| {
            log.lock().unwrap().push(format!("closure:{}:{}", event, meta.key()));
            Verdict::Continue
        });
    }
    for event in [
        AggregateEvent::CreatedWithMetas,
        AggregateEvent::UpdatedWithMetas,
        AggregateEvent::SavedWithMetas,
    ] {
        let log = Arc::clone(&log);
        users = users.on_aggregate(event, move |_| {
            log.lock().unwrap().push(format!("closure:{}", event));
        });
    }
    db.register(users).expect("register");
    db.migrate("users").expect("migrate");

    for event in MetaEvent::ALL {
        let log = Arc::clone(&log);
        db.dispatcher()
            .listen(event, move |payload| {
                log.lock()
                    .unwrap()
                    .push(format!("listener:{}:{}", payload.event, payload.meta.key()));
                Verdict::Continue
            })
            .unwrap();
    }
    (db, log)
}

fn take(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.lock().unwrap())
}

fn tiers(event: &str, key: &str) -> Vec<String> {
    ["closure", "observer", "listener"]
        .iter()
        .map(|tier| format!("{}:{}:{}", tier, event, key))
        .collect()
}

#[test]
fn creation_fires_in_tier_order() {
    let (db, log) = recording_setup();
    let mut user = db.make("users").unwrap();
    user.set("foo", "bar").unwrap();
    user.save().unwrap();

    let mut expected = Vec::new();
    for event in ["metaSaving", "metaCreating", "metaCreated", "metaSaved"] {
        expected.extend(tiers(event, "foo"));
    }
    expected.push("closure:createdWithMetas".to_owned());
    expected.push("closure:savedWithMetas".to_owned());
    expected.push("observer:savedWithMetas".to_owned());
    assert_eq!(take(&log), expected);
}

#[test]
fn update_and_delete_sequences() {
    let (db, log) = recording_setup();
    let mut user = db.make("users").unwrap();
    user.set("foo", "bar").unwrap();
    user.set("gone", true).unwrap();
    user.save().unwrap();
    take(&log);

    user.set("foo", "baz").unwrap();
    user.unset("gone").unwrap();
    user.save().unwrap();

    let mut expected = Vec::new();
    for event in ["metaSaving", "metaUpdating", "metaUpdated", "metaSaved"] {
        expected.extend(tiers(event, "foo"));
    }
    for event in ["metaDeleting", "metaDeleted"] {
        expected.extend(tiers(event, "gone"));
    }
    // nothing native changed, so only the unconditional aggregate fires
    expected.push("closure:savedWithMetas".to_owned());
    expected.push("observer:savedWithMetas".to_owned());
    assert_eq!(take(&log), expected);
}

#[test]
fn untouched_records_fire_nothing() {
    let (db, log) = recording_setup();
    let mut user = db.make("users").unwrap();
    user.set("foo", "bar").unwrap();
    user.save().unwrap();
    take(&log);

    user.save().unwrap();
    assert_eq!(
        take(&log),
        vec!["closure:savedWithMetas".to_owned(), "observer:savedWithMetas".to_owned()]
    );
}

fn veto_setup(event: MetaEvent, veto: Arc<AtomicBool>) -> Database {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch("create table users (id integer primary key autoincrement, name text);")
        .expect("users table");
    db.register(EntityType::new("users").on_meta(event, move |_, meta| {
        if veto.load(Ordering::SeqCst) && meta.key() == "x" {
            Verdict::Veto
        } else {
            Verdict::Continue
        }
    }))
    .expect("register");
    db.migrate("users").expect("migrate");
    db
}

fn stored(db: &Database, id: i64) -> Vec<(String, Option<String>)> {
    let schema = db.entity_type("users").unwrap();
    db.meta_rows(&schema, id)
        .unwrap()
        .into_iter()
        .map(|row| (row.key, row.value))
        .collect()
}

#[test]
fn creating_veto_keeps_the_value_in_memory_only() {
    let veto = Arc::new(AtomicBool::new(true));
    let db = veto_setup(MetaEvent::Creating, Arc::clone(&veto));
    let mut user = db.make("users").unwrap();
    user.set("x", "y").unwrap();
    user.set("other", "kept").unwrap();
    let report = user.save().unwrap();
    let id = user.id().unwrap();

    assert!(matches!(
        report.outcome("x").unwrap().status,
        FlushStatus::Vetoed(MetaEvent::Creating)
    ));
    assert!(matches!(report.outcome("other").unwrap().status, FlushStatus::Created));
    assert_eq!(user.get("x").unwrap(), Value::from("y"));
    assert_eq!(stored(&db, id), vec![("other".to_owned(), Some("kept".to_owned()))]);
    assert!(user.is_meta_dirty(&["x"]).unwrap());

    veto.store(false, Ordering::SeqCst);
    let report = user.save().unwrap();
    assert!(matches!(report.outcome("x").unwrap().status, FlushStatus::Created));
    assert!(stored(&db, id).contains(&("x".to_owned(), Some("y".to_owned()))));
}

#[test]
fn deleting_veto_keeps_the_row() {
    let veto = Arc::new(AtomicBool::new(true));
    let db = veto_setup(MetaEvent::Deleting, Arc::clone(&veto));
    let mut user = db.make("users").unwrap();
    user.set("x", "y").unwrap();
    user.save().unwrap();
    let id = user.id().unwrap();

    user.unset("x").unwrap();
    let report = user.save().unwrap();
    assert!(report.outcome("x").unwrap().is_vetoed());
    assert_eq!(stored(&db, id).len(), 1);
    assert!(!user.has_meta("x").unwrap());

    veto.store(false, Ordering::SeqCst);
    let report = user.save().unwrap();
    assert!(matches!(report.outcome("x").unwrap().status, FlushStatus::Deleted));
    assert!(stored(&db, id).is_empty());
}

#[test]
fn saving_veto_precedes_creating() {
    let creating = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&creating);
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch("create table users (id integer primary key autoincrement, name text);")
        .unwrap();
    db.register(
        EntityType::new("users")
            .on_meta(MetaEvent::Saving, |_, _| Verdict::Veto)
            .on_meta(MetaEvent::Creating, move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Verdict::Continue
            }),
    )
    .unwrap();
    db.migrate("users").unwrap();

    let mut user = db.make("users").unwrap();
    user.set("x", "y").unwrap();
    let report = user.save().unwrap();
    assert!(matches!(
        report.outcome("x").unwrap().status,
        FlushStatus::Vetoed(MetaEvent::Saving)
    ));
    assert_eq!(creating.load(Ordering::SeqCst), 0);
}

#[test]
fn a_veto_stops_later_tiers() {
    let (db, log) = recording_setup();
    db.dispatcher()
        .listen(MetaEvent::Saving, |_| Verdict::Veto)
        .unwrap();
    let mut user = db.make("users").unwrap();
    user.set("foo", "bar").unwrap();
    let report = user.save().unwrap();
    assert!(report.outcome("foo").unwrap().is_vetoed());
    // the recording listener was registered first and still ran
    let events = take(&log);
    assert_eq!(&events[..3], tiers("metaSaving", "foo").as_slice());
    assert!(!events.iter().any(|e| e.contains("metaCreating")));

    db.dispatcher().forget(MetaEvent::Saving).unwrap();
    let report = user.save().unwrap();
    assert!(matches!(report.outcome("foo").unwrap().status, FlushStatus::Created));
}

#[test]
fn post_event_vetoes_are_advisory() {
    let db = veto_setup(MetaEvent::Created, Arc::new(AtomicBool::new(true)));
    let mut user = db.make("users").unwrap();
    user.set("x", "y").unwrap();
    let report = user.save().unwrap();
    let outcome = report.outcome("x").unwrap();
    assert!(matches!(outcome.status, FlushStatus::Created));
    assert_eq!(outcome.advisory_vetoes, vec![MetaEvent::Created]);
    assert_eq!(stored(&db, user.id().unwrap()).len(), 1);
}

/// Panics when dropped, poisoning whatever lock is held at the time.
struct Tripwire;
impl Drop for Tripwire {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("tripwire");
        }
    }
}

#[test]
fn post_event_dispatch_errors_are_reported() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch("create table users (id integer primary key autoincrement, name text);")
        .expect("users table");
    let tripwire = Tripwire;
    db.dispatcher()
        .listen(MetaEvent::Deleted, move |_| {
            let _ = &tripwire;
            Verdict::Continue
        })
        .unwrap();
    // dropping the listener while the listener map is locked poisons it
    let users = EntityType::new("users").on_meta(MetaEvent::Created, |entity, _| {
        let dispatcher = entity.database().dispatcher();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dispatcher.forget(MetaEvent::Deleted)
        }));
        Verdict::Continue
    });
    db.register(users).unwrap();
    db.migrate("users").unwrap();

    let mut user = db.make("users").unwrap();
    user.set("x", "y").unwrap();
    let report = user.save().unwrap();
    let outcome = report.outcome("x").unwrap();
    assert!(matches!(outcome.status, FlushStatus::Created));
    let failed: Vec<MetaEvent> = outcome.advisory_errors.iter().map(|(event, _)| *event).collect();
    assert_eq!(failed, vec![MetaEvent::Created, MetaEvent::Saved]);
    assert!(outcome.advisory_vetoes.is_empty());
    assert_eq!(stored(&db, user.id().unwrap()).len(), 1);
}

#[test]
fn aggregate_events_follow_the_native_save() {
    let created = Arc::new(AtomicUsize::new(0));
    let updated = Arc::new(AtomicUsize::new(0));
    let saved = Arc::new(AtomicUsize::new(0));
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch("create table users (id integer primary key autoincrement, name text);")
        .unwrap();
    let (c, u, s) = (Arc::clone(&created), Arc::clone(&updated), Arc::clone(&saved));
    db.register(
        EntityType::new("users")
            .on_aggregate(AggregateEvent::CreatedWithMetas, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_aggregate(AggregateEvent::UpdatedWithMetas, move |_| {
                u.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .unwrap();
    db.migrate("users").unwrap();
    db.dispatcher()
        .listen_aggregate(AggregateEvent::SavedWithMetas, move |payload| {
            assert!(payload.entity.exists());
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let mut user = db.make("users").unwrap();
    user.set("foo", "bar").unwrap();
    user.save().unwrap();
    assert_eq!(
        (created.load(Ordering::SeqCst), updated.load(Ordering::SeqCst), saved.load(Ordering::SeqCst)),
        (1, 0, 1)
    );

    user.set("name", "Ada").unwrap();
    user.save().unwrap();
    assert_eq!(
        (created.load(Ordering::SeqCst), updated.load(Ordering::SeqCst), saved.load(Ordering::SeqCst)),
        (1, 1, 2)
    );
}

#[test]
fn handlers_see_the_owning_entity() {
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.execute_batch("create table users (id integer primary key autoincrement, name text);")
        .unwrap();
    db.register(EntityType::new("users").on_meta(MetaEvent::Created, move |user, meta| {
        *slot.lock().unwrap() = Some((user.id(), meta.owner_id(), meta.id().is_some()));
        Verdict::Continue
    }))
    .unwrap();
    db.migrate("users").unwrap();

    let mut user = db.make("users").unwrap();
    user.set("foo", "bar").unwrap();
    user.save().unwrap();
    let id = user.id();
    assert_eq!(*seen.lock().unwrap(), Some((id, id, true)));
}

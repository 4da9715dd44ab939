//! Metable – typed meta attributes for entities with a fixed schema.
//!
//! An entity type maps onto a table with fixed columns. Metable lets any
//! entity carry an open-ended set of extra key/value attributes, its *metas*,
//! stored one row per key in a side table (`<table>_meta`) and reached through
//! the same `get`/`set` surface as the native columns.
//!
//! * A [`schema::EntityType`] declares table names, default meta values,
//!   accessors, mutators, relations, casts and lifecycle handlers.
//! * An [`entity::Entity`] holds native attributes and lazily loads its
//!   [`meta::MetaSet`] on first access.
//! * The [`resolver`] decides for each key whether it is native, a relation
//!   or a meta.
//! * Meta writes are buffered until [`entity::Entity::save`], which flushes
//!   them through the [`events`] lifecycle (`metaSaving`, `metaCreating`, ...)
//!   where handlers may veto individual writes.
//! * Values cross the storage boundary through a [`datatype::ValueCodec`] as
//!   a `(type tag, payload)` pair; references to other entities are stored as
//!   `type#id` and resolved through a [`reference::ReferenceCache`].
//!
//! ## Modules
//! * [`datatype`] – [`Value`], [`TypeTag`] and the default [`JsonCodec`].
//! * [`meta`] – meta records, the per-entity set and flush outcomes.
//! * [`events`] – event names, handler tiers and the [`Dispatcher`].
//! * [`persist`] – the [`persist::Store`] collaborator and its SQLite
//!   [`persist::Persistor`].
//! * [`database`] – the [`Database`] tying types, store and dispatcher.
//! * [`settings`] – [`Settings`] read from `metable.toml` and the environment.
//!
//! ## Quick Start
//! ```
//! use metable::{Database, EntityType, PersistenceMode};
//!
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! db.execute_batch("create table users (id integer primary key autoincrement, name text);")
//!     .unwrap();
//! db.register(EntityType::new("users").with_default("theme", "light")).unwrap();
//! db.migrate("users").unwrap();
//!
//! let mut user = db.make("users").unwrap();
//! user.set("name", "Ada").unwrap(); // a column, stored natively
//! user.set("nickname", "countess").unwrap(); // no such column, stored as meta
//! user.save().unwrap();
//!
//! let user = db.find_or_fail("users", user.id().unwrap()).unwrap();
//! assert_eq!(user.get("nickname").unwrap().as_str(), Some("countess"));
//! assert_eq!(user.get("theme").unwrap().as_str(), Some("light"));
//! ```

pub mod database;
pub mod datatype;
pub mod entity;
pub mod error;
pub mod events;
pub mod meta;
pub mod persist;
pub mod reference;
pub mod resolver;
pub mod schema;
pub mod settings;

pub use database::{Database, PersistenceMode};
pub use datatype::{JsonCodec, TypeTag, Value, ValueCodec};
pub use entity::{Entity, MetaFallback, SaveReport};
pub use error::{MetableError, Result};
pub use events::{AggregateEvent, Dispatcher, MetaEvent, MetaObserver, Verdict};
pub use meta::{FlushOutcome, FlushStatus, MetaRecord};
pub use schema::{AttributeCast, EntityType};
pub use settings::Settings;

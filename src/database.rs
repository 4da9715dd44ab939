//! The registry of entity types, the store they share and the event
//! dispatcher.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::datatype::Value;
use crate::entity::Entity;
use crate::error::{MetableError, Result};
use crate::events::Dispatcher;
use crate::meta::{KeyHasher, normalize_key};
use crate::persist::{MetaRow, Persistor, Store};
use crate::reference::{ModelLoader, ReferenceCache, ReferenceResolver};
use crate::schema::{DEFAULT_META_SUFFIX, EntityType};
use crate::settings::Settings;

pub use crate::persist::PersistenceMode;

/// Cheap to clone; clones share the registry, the store and the dispatcher.
#[derive(Clone)]
pub struct Database {
    types: Arc<RwLock<HashMap<String, Arc<EntityType>, KeyHasher>>>,
    store: Arc<Mutex<Box<dyn Store>>>,
    columns: Arc<Mutex<HashMap<String, Arc<Vec<String>>, KeyHasher>>>,
    dispatcher: Arc<Dispatcher>,
    meta_suffix: Arc<String>,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        Ok(Self::with_store(Persistor::open(&mode)?))
    }
    /// Opens the configured store. Types registered later without an explicit
    /// meta table get the configured table suffix.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut db = Self::new(settings.persistence_mode())?;
        db.meta_suffix = Arc::new(settings.meta.table_suffix.clone());
        Ok(db)
    }
    pub fn with_store(store: impl Store + 'static) -> Self {
        Self {
            types: Arc::new(RwLock::new(HashMap::default())),
            store: Arc::new(Mutex::new(Box::new(store))),
            columns: Arc::new(Mutex::new(HashMap::default())),
            dispatcher: Arc::new(Dispatcher::new()),
            meta_suffix: Arc::new(DEFAULT_META_SUFFIX.to_owned()),
        }
    }
    /// Registers the type under its name, replacing an earlier registration.
    pub fn register(&self, mut entity_type: EntityType) -> Result<Arc<EntityType>> {
        if !entity_type.names_meta_table() {
            let meta_table = format!("{}{}", entity_type.table(), self.meta_suffix);
            entity_type = entity_type.with_meta_table(meta_table);
        }
        let entity_type = Arc::new(entity_type);
        let replaced = self
            .types
            .write()?
            .insert(entity_type.name().to_owned(), Arc::clone(&entity_type))
            .is_some();
        debug!(name = entity_type.name(), replaced, "registered entity type");
        Ok(entity_type)
    }
    pub fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        self.types
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| MetableError::UnknownType(name.to_owned()))
    }
    pub fn is_registered(&self, name: &str) -> bool {
        self.types
            .read()
            .map(|types| types.contains_key(name))
            .unwrap_or(false)
    }
    /// Creates the meta table of a registered type if it is missing.
    pub fn migrate(&self, type_name: &str) -> Result<()> {
        let schema = self.entity_type(type_name)?;
        let meta_table = schema.meta_table();
        self.store(|store| {
            store.create_meta_table(
                &meta_table,
                schema.table(),
                schema.primary_key(),
                &schema.meta_key_name(),
            )
        })?;
        self.forget_columns()?;
        info!(type_name, meta_table = %meta_table, "migrated");
        Ok(())
    }
    /// A new, unsaved entity.
    pub fn make(&self, type_name: &str) -> Result<Entity> {
        Ok(Entity::new(self.clone(), self.entity_type(type_name)?))
    }
    pub fn find(&self, type_name: &str, id: i64) -> Result<Option<Entity>> {
        let schema = self.entity_type(type_name)?;
        let found = self.store(|store| store.find(schema.table(), schema.primary_key(), id))?;
        match found {
            Some(attributes) => Ok(Some(Entity::hydrate(self.clone(), schema, attributes)?)),
            None => Ok(None),
        }
    }
    pub fn find_or_fail(&self, type_name: &str, id: i64) -> Result<Entity> {
        self.find(type_name, id)?.ok_or_else(|| MetableError::NotFound {
            type_name: type_name.to_owned(),
            id,
        })
    }
    /// Persisted entities holding the meta value under the key.
    pub fn where_meta(
        &self,
        type_name: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<Vec<Entity>> {
        let schema = self.entity_type(type_name)?;
        let value: Value = value.into();
        let cache = ReferenceCache::new();
        let (_, raw) = {
            let refs = ReferenceResolver::new(&cache, self);
            schema.codec().encode(&value, &refs)?
        };
        let meta_table = schema.meta_table();
        let owner_key = schema.meta_key_name();
        let key = normalize_key(key);
        let owners = self
            .store(|store| store.where_meta(&meta_table, &owner_key, &key, raw.as_deref()))?;
        let mut entities = Vec::with_capacity(owners.len());
        for id in owners {
            if let Some(entity) = self.find(type_name, id)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }
    pub fn meta_rows(&self, schema: &EntityType, owner_id: i64) -> Result<Vec<MetaRow>> {
        let meta_table = schema.meta_table();
        let owner_key = schema.meta_key_name();
        self.store(|store| store.related(&meta_table, &owner_key, owner_id))
    }
    /// Column names of a table, cached after the first lookup.
    pub fn columns(&self, table: &str) -> Result<Arc<Vec<String>>> {
        if let Some(columns) = self.columns.lock()?.get(table) {
            return Ok(Arc::clone(columns));
        }
        let columns = Arc::new(self.store(|store| store.columns(table))?);
        self.columns
            .lock()?
            .insert(table.to_owned(), Arc::clone(&columns));
        Ok(columns)
    }
    pub fn forget_columns(&self) -> Result<()> {
        self.columns.lock()?.clear();
        Ok(())
    }
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.store(|store| store.execute_batch(sql))?;
        self.forget_columns()
    }
    pub(crate) fn store<T>(&self, work: impl FnOnce(&mut dyn Store) -> Result<T>) -> Result<T> {
        let mut store = self.store.lock()?;
        work(&mut **store)
    }
}

impl ModelLoader for Database {
    fn knows(&self, type_name: &str) -> bool {
        self.is_registered(type_name)
    }
    fn load(&self, type_name: &str, id: i64) -> Result<Entity> {
        self.find_or_fail(type_name, id)
    }
    fn instantiate(&self, type_name: &str) -> Result<Entity> {
        self.make(type_name)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let types: Vec<String> = self
            .types
            .read()
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("Database")
            .field("types", &types)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

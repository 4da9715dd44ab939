//! Resolution of model references stored in meta values.
//!
//! A meta value may point at another entity, persisted as `type#id`. The
//! [`ReferenceCache`] keeps every entity that has been resolved through it, so
//! decoding the same reference twice yields the same `Arc<Entity>`.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::entity::Entity;
use crate::error::{MetableError, Result};
use crate::meta::KeyHasher;

/// Looks up registered entity types and loads their instances.
pub trait ModelLoader: Send + Sync {
    fn knows(&self, type_name: &str) -> bool;
    /// Loads a persisted entity, failing with `NotFound` when there is none.
    fn load(&self, type_name: &str, id: i64) -> Result<Entity>;
    /// A fresh, never persisted instance of the type.
    fn instantiate(&self, type_name: &str) -> Result<Entity>;
}

#[derive(Default)]
pub struct ReferenceCache {
    kept: Mutex<HashMap<(String, i64), Arc<Entity>, KeyHasher>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, type_name: &str, id: i64) -> Result<Option<Arc<Entity>>> {
        let kept = self.kept.lock()?;
        Ok(kept.get(&(type_name.to_owned(), id)).cloned())
    }
    /// Keeps the entity unless an instance for the same reference is already
    /// kept, in which case that one is returned. Entities without an id pass
    /// through untouched.
    pub fn keep(&self, entity: Arc<Entity>) -> Result<Arc<Entity>> {
        let Some(id) = entity.id() else {
            return Ok(entity);
        };
        let mut kept = self.kept.lock()?;
        let kept = kept
            .entry((entity.type_name().to_owned(), id))
            .or_insert(entity);
        Ok(Arc::clone(kept))
    }
    /// Keeps the entity in place of any instance kept for the same reference.
    pub fn replace(&self, entity: Arc<Entity>) -> Result<()> {
        let Some(id) = entity.id() else {
            return Ok(());
        };
        self.kept
            .lock()?
            .insert((entity.type_name().to_owned(), id), entity);
        Ok(())
    }
    pub fn forget(&self, type_name: &str, id: i64) -> Result<bool> {
        let mut kept = self.kept.lock()?;
        Ok(kept.remove(&(type_name.to_owned(), id)).is_some())
    }
    pub fn clear(&self) -> Result<()> {
        self.kept.lock()?.clear();
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.kept.lock().map(|kept| kept.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ReferenceCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReferenceCache").field("kept", &self.len()).finish()
    }
}

/// Borrowed view combining a cache with the loader that fills it.
pub struct ReferenceResolver<'a> {
    cache: &'a ReferenceCache,
    loader: &'a dyn ModelLoader,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(cache: &'a ReferenceCache, loader: &'a dyn ModelLoader) -> Self {
        Self { cache, loader }
    }
    pub fn resolve(&self, type_name: &str, id: i64) -> Result<Arc<Entity>> {
        if let Some(entity) = self.cache.get(type_name, id)? {
            trace!(type_name, id, "reference served from cache");
            return Ok(entity);
        }
        if !self.loader.knows(type_name) {
            return Err(MetableError::InvalidReference(format!(
                "{}{}{} names an unregistered entity type",
                type_name,
                crate::datatype::REFERENCE_SEPARATOR,
                id
            )));
        }
        let entity = Arc::new(self.loader.load(type_name, id)?);
        trace!(type_name, id, "reference loaded");
        self.cache.keep(entity)
    }
    pub fn instantiate(&self, type_name: &str) -> Result<Entity> {
        if !self.loader.knows(type_name) {
            return Err(MetableError::InvalidReference(format!(
                "{} names an unregistered entity type",
                type_name
            )));
        }
        self.loader.instantiate(type_name)
    }
    /// Validates an entity about to be stored as a reference and keeps it, so
    /// that reading the value back returns the very same instance.
    pub fn remember(&self, entity: &Arc<Entity>) -> Result<()> {
        if !self.loader.knows(entity.type_name()) {
            return Err(MetableError::InvalidReference(format!(
                "{} is not a registered entity type",
                entity.type_name()
            )));
        }
        self.cache.replace(Arc::clone(entity))
    }
}

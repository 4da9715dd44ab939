//! Routing of plain attribute access between native storage, relations and
//! meta records.
//!
//! Reads try, in order: a non-null native attribute, a loaded relation, the
//! meta record or its declared default, and finally pass the result through
//! the key's accessor. Writes go native when the entity owns the key (primary
//! key, present attribute, cast or table column). Otherwise a value equal to
//! the default removes the override, a mutator takes over when registered,
//! and anything else becomes a meta value.
use tracing::trace;

use crate::datatype::Value;
use crate::entity::Entity;
use crate::error::Result;

pub fn resolve_get(entity: &Entity, key: &str) -> Result<Value> {
    let native = match entity.native_key(key)? {
        Some(column) => entity.attribute(&column)?,
        None => entity.attribute(key)?,
    };
    if !native.is_null() || !entity.schema().is_fluent() {
        return Ok(native);
    }
    if entity.schema().has_relation(key) {
        if let Some(related) = entity.relation(key) {
            trace!(key, "served from relation");
            return Ok(related.clone());
        }
    }
    let value = entity.get_meta(key)?;
    Ok(match entity.schema().accessor(key) {
        Some(accessor) => {
            trace!(key, "passing meta value through accessor");
            accessor(value)
        }
        None => value,
    })
}

pub fn resolve_set(entity: &mut Entity, key: &str, value: Value) -> Result<()> {
    let native = entity.native_key(key)?;
    if !entity.schema().is_fluent() || native.is_some() {
        return entity.set_attribute(native.as_deref().unwrap_or(key), value);
    }
    if entity.schema().defaults().matches(key, &value) {
        trace!(key, "value equals the default");
        return entity.unset_meta(key);
    }
    if let Some(mutator) = entity.schema().mutator(key).cloned() {
        trace!(key, "handing value to mutator");
        return mutator(entity, value);
    }
    entity.set_meta(key, value)
}

/// Whether a plain read of the key would yield a non-null value.
pub fn resolve_isset(entity: &Entity, key: &str) -> Result<bool> {
    Ok(!resolve_get(entity, key)?.is_null())
}

/// Removes the key from native storage when owned there, then unsets the meta
/// of the same name.
pub fn resolve_unset(entity: &mut Entity, key: &str) -> Result<()> {
    let native = entity.native_key(key)?;
    if !entity.schema().is_fluent() || native.is_some() {
        entity.remove_attribute(native.as_deref().unwrap_or(key));
    }
    entity.unset_meta(key)
}

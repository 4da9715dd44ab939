//! Entities: native attributes plus a lazily loaded set of meta records.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::datatype::{REFERENCE_SEPARATOR, Value};
use crate::error::{MetableError, Result};
use crate::events::{AggregateEvent, MetaEvent, Verdict};
use crate::meta::{
    FlushAction, FlushOutcome, FlushStatus, MetaRecord, MetaSet, normalize_key, split_keys,
};
use crate::resolver;
use crate::schema::EntityType;

/// Key under which serialized entities carry their metas.
pub const META_DATA_KEY: &str = "meta_data";

/// Fallback for keys without a value or a declared default.
#[derive(Debug, Clone)]
pub enum MetaFallback {
    Value(Value),
    PerKey(HashMap<String, Value>),
}

impl MetaFallback {
    fn for_key(&self, key: &str) -> Value {
        match self {
            MetaFallback::Value(value) => value.clone(),
            MetaFallback::PerKey(values) => values
                .get(key)
                .or_else(|| values.iter().find(|(k, _)| normalize_key(k) == key).map(|(_, v)| v))
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

/// What a call to [`Entity::save`] did.
#[derive(Debug, Default)]
pub struct SaveReport {
    pub created: bool,
    pub updated: bool,
    pub metas: Vec<FlushOutcome>,
}

impl SaveReport {
    pub fn failures(&self) -> impl Iterator<Item = &FlushOutcome> {
        self.metas.iter().filter(|outcome| outcome.is_failed())
    }
    pub fn vetoes(&self) -> impl Iterator<Item = &FlushOutcome> {
        self.metas.iter().filter(|outcome| outcome.is_vetoed())
    }
    pub fn outcome(&self, key: &str) -> Option<&FlushOutcome> {
        let key = normalize_key(key);
        self.metas.iter().find(|outcome| outcome.key == key)
    }
}

/// A record of some entity type. An instance is meant to be used by one
/// caller at a time; the meta set it owns is never shared.
pub struct Entity {
    db: Database,
    schema: Arc<EntityType>,
    id: Option<i64>,
    exists: bool,
    attributes: BTreeMap<String, Value>,
    original: BTreeMap<String, Value>,
    relations: BTreeMap<String, Value>,
    metas: OnceLock<MetaSet>,
}

impl Entity {
    pub(crate) fn new(db: Database, schema: Arc<EntityType>) -> Self {
        Self {
            db,
            schema,
            id: None,
            exists: false,
            attributes: BTreeMap::new(),
            original: BTreeMap::new(),
            relations: BTreeMap::new(),
            metas: OnceLock::new(),
        }
    }
    pub(crate) fn hydrate(
        db: Database,
        schema: Arc<EntityType>,
        attributes: BTreeMap<String, Value>,
    ) -> Result<Self> {
        let id = match attributes.get(schema.primary_key()) {
            Some(Value::Int(id)) => *id,
            other => {
                return Err(MetableError::corrupt(format!(
                    "{} row has no integer {}: {:?}",
                    schema.name(),
                    schema.primary_key(),
                    other
                )));
            }
        };
        Ok(Self {
            db,
            schema,
            id: Some(id),
            exists: true,
            original: attributes.clone(),
            attributes,
            relations: BTreeMap::new(),
            metas: OnceLock::new(),
        })
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }
    pub fn schema(&self) -> &Arc<EntityType> {
        &self.schema
    }
    pub fn database(&self) -> &Database {
        &self.db
    }
    pub fn id(&self) -> Option<i64> {
        self.id
    }
    /// Whether the entity has a row in its table.
    pub fn exists(&self) -> bool {
        self.exists
    }
    /// `type#id`, or just the type name before the first save.
    pub fn reference(&self) -> String {
        match self.id {
            Some(id) => format!("{}{}{}", self.type_name(), REFERENCE_SEPARATOR, id),
            None => self.type_name().to_owned(),
        }
    }

    // native storage

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }
    /// The native value with its cast applied, null when absent.
    pub fn attribute(&self, key: &str) -> Result<Value> {
        let stored = self.attributes.get(key).cloned().unwrap_or(Value::Null);
        match self.schema.cast(key) {
            Some(cast) => cast.get(key, stored),
            None => Ok(stored),
        }
    }
    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = match self.schema.cast(key) {
            Some(cast) => cast.set(key, value.into())?,
            None => value.into(),
        };
        if key == self.schema.primary_key() {
            self.id = value.as_i64();
        }
        self.attributes.insert(key.to_owned(), value);
        Ok(())
    }
    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }
    /// Whether native attributes changed since the last load or save.
    pub fn is_dirty(&self) -> bool {
        !self.dirty_attributes().is_empty()
    }
    fn dirty_attributes(&self) -> BTreeMap<String, Value> {
        let mut dirty: BTreeMap<String, Value> = self
            .attributes
            .iter()
            .filter(|(key, value)| self.original.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for key in self.original.keys() {
            if !self.attributes.contains_key(key) {
                dirty.insert(key.clone(), Value::Null);
            }
        }
        dirty
    }
    /// Column names compare without regard to ASCII case, as SQLite does.
    pub fn has_column(&self, key: &str) -> Result<bool> {
        Ok(self.column(key)?.is_some())
    }
    fn column(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .columns(self.schema.table())?
            .iter()
            .find(|column| column.eq_ignore_ascii_case(key))
            .cloned())
    }
    /// The name the key is stored under natively, or `None` when the entity
    /// does not own it.
    pub(crate) fn native_key(&self, key: &str) -> Result<Option<String>> {
        if key == self.schema.primary_key()
            || self.attributes.contains_key(key)
            || self.schema.cast(key).is_some()
        {
            return Ok(Some(key.to_owned()));
        }
        self.column(key)
    }

    pub fn set_relation(&mut self, name: &str, value: impl Into<Value>) {
        self.relations.insert(name.to_owned(), value.into());
    }
    pub fn relation(&self, name: &str) -> Option<&Value> {
        self.relations.get(name)
    }

    // attribute surface

    pub fn get(&self, key: &str) -> Result<Value> {
        resolver::resolve_get(self, key)
    }
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        resolver::resolve_set(self, key, value.into())
    }
    pub fn isset(&self, key: &str) -> Result<bool> {
        resolver::resolve_isset(self, key)
    }
    pub fn unset(&mut self, key: &str) -> Result<()> {
        resolver::resolve_unset(self, key)
    }

    // metas

    fn load_metas(&self) -> Result<MetaSet> {
        let defaults = Arc::clone(self.schema.defaults());
        let codec = Arc::clone(self.schema.codec());
        match (self.exists, self.id) {
            (true, Some(id)) => {
                let rows = self.db.meta_rows(&self.schema, id)?;
                debug!(entity = %self.reference(), rows = rows.len(), "hydrated meta set");
                Ok(MetaSet::hydrate(defaults, codec, rows))
            }
            _ => Ok(MetaSet::new(defaults, codec)),
        }
    }
    /// The meta set, loaded from the store on first access.
    pub fn metas(&self) -> Result<&MetaSet> {
        if let Some(metas) = self.metas.get() {
            return Ok(metas);
        }
        let loaded = self.load_metas()?;
        Ok(self.metas.get_or_init(|| loaded))
    }
    fn metas_mut(&mut self) -> Result<&mut MetaSet> {
        if self.metas.get().is_none() {
            let loaded = self.load_metas()?;
            let _ = self.metas.set(loaded);
        }
        self.metas
            .get_mut()
            .ok_or_else(|| MetableError::Invariant("meta set missing after load".into()))
    }
    pub fn get_meta(&self, key: &str) -> Result<Value> {
        Ok(self
            .metas()?
            .value_or_default(key, &self.db)?
            .unwrap_or(Value::Null))
    }
    pub fn get_meta_or(&self, key: &str, fallback: impl Into<Value>) -> Result<Value> {
        Ok(self
            .metas()?
            .value_or_default(key, &self.db)?
            .unwrap_or_else(|| fallback.into()))
    }
    /// Values of the requested keys that are present or have a default, in
    /// the order requested.
    pub fn get_metas(&self, keys: &[&str]) -> Result<Vec<(String, Value)>> {
        let metas = self.metas()?;
        let mut found = Vec::new();
        for key in expand(keys) {
            if let Some(value) = metas.value_or_default(&key, &self.db)? {
                found.push((key, value));
            }
        }
        Ok(found)
    }
    /// Every requested key, falling back when neither a value nor a default
    /// exists.
    pub fn get_metas_or(&self, keys: &[&str], fallback: &MetaFallback) -> Result<Vec<(String, Value)>> {
        let metas = self.metas()?;
        expand(keys)
            .into_iter()
            .map(|key| {
                let value = match metas.value_or_default(&key, &self.db)? {
                    Some(value) => value,
                    None => fallback.for_key(&key),
                };
                Ok((key, value))
            })
            .collect()
    }
    pub fn all_metas(&self) -> Result<Vec<(String, Value)>> {
        self.metas()?.all_visible(&self.db)
    }
    /// The visible record behind a key, undecoded.
    pub fn meta_record(&self, key: &str) -> Result<Option<&MetaRecord>> {
        Ok(self.metas()?.get(key))
    }
    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let db = self.db.clone();
        debug!(key, tag = %value.type_tag(), "set meta");
        self.metas_mut()?.set(key, value, &db)
    }
    pub fn set_metas<I, K, V>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (key, value) in pairs {
            self.set_meta(key.as_ref(), value)?;
        }
        Ok(())
    }
    pub fn unset_meta(&mut self, key: &str) -> Result<()> {
        debug!(key, "unset meta");
        self.metas_mut()?.unset(key);
        Ok(())
    }
    /// Unsets each key; a key may also be a `,` or `|` separated list.
    pub fn unset_metas(&mut self, keys: &[&str]) -> Result<()> {
        for key in expand(keys) {
            self.unset_meta(&key)?;
        }
        Ok(())
    }
    pub fn has_meta(&self, key: &str) -> Result<bool> {
        Ok(self.metas()?.has(key))
    }
    /// True only when every key is present.
    pub fn has_metas(&self, keys: &[&str]) -> Result<bool> {
        let metas = self.metas()?;
        Ok(expand(keys).iter().all(|key| metas.has(key)))
    }
    pub fn is_meta_dirty(&self, keys: &[&str]) -> Result<bool> {
        match self.metas.get() {
            Some(metas) => Ok(metas.is_dirty(keys)),
            None => Ok(false),
        }
    }
    pub fn has_default_meta_value(&self, key: &str) -> bool {
        self.schema.has_default(key)
    }
    /// Drops a cached reference, e.g. after the referenced entity was deleted.
    pub fn forget_reference(&self, type_name: &str, id: i64) -> Result<bool> {
        match self.metas.get() {
            Some(metas) => metas.forget_reference(type_name, id),
            None => Ok(false),
        }
    }

    // lifecycle

    /// Writes the native row, flushes the metas and raises the aggregate
    /// events.
    pub fn save(&mut self) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        let table = self.schema.table().to_owned();
        let primary_key = self.schema.primary_key().to_owned();
        match (self.exists, self.id) {
            (true, Some(id)) => {
                let dirty = self.dirty_attributes();
                if !dirty.is_empty() {
                    self.db
                        .store(|store| store.update(&table, &primary_key, id, &dirty))?;
                    report.updated = true;
                }
            }
            _ => {
                let id = self.db.store(|store| store.insert(&table, &self.attributes))?;
                self.id = Some(id);
                self.exists = true;
                self.attributes.insert(primary_key, Value::Int(id));
                report.created = true;
            }
        }
        self.original = self.attributes.clone();
        report.metas = self.flush_metas()?;

        let events = self.schema.events();
        let dispatcher = self.db.dispatcher();
        if report.created {
            events.notify(AggregateEvent::CreatedWithMetas, self, dispatcher)?;
        } else if report.updated {
            events.notify(AggregateEvent::UpdatedWithMetas, self, dispatcher)?;
        }
        events.notify(AggregateEvent::SavedWithMetas, self, dispatcher)?;
        Ok(report)
    }

    /// Persists pending meta changes, one outcome per record. A record whose
    /// write fails or is vetoed stays pending for the next flush.
    pub fn flush_metas(&mut self) -> Result<Vec<FlushOutcome>> {
        let Some(metas) = self.metas.get() else {
            return Ok(Vec::new());
        };
        let owner_id = match (self.exists, self.id) {
            (true, Some(id)) => id,
            _ => {
                return Err(MetableError::Invariant(format!(
                    "cannot flush metas of unsaved {}",
                    self.type_name()
                )));
            }
        };
        let plan = metas.plan();
        let mut outcomes = Vec::with_capacity(plan.len());
        for (key, action) in plan {
            let outcome = match action {
                FlushAction::Skip => FlushOutcome::new(key, FlushStatus::Skipped),
                FlushAction::Discard => {
                    self.forget_record(&key);
                    FlushOutcome::new(key, FlushStatus::Deleted)
                }
                FlushAction::Delete => self.flush_delete(key),
                FlushAction::Create | FlushAction::Update => {
                    self.flush_write(key, action == FlushAction::Create, owner_id)
                }
            };
            outcomes.push(outcome);
        }
        let written = outcomes.iter().filter(|outcome| outcome.wrote()).count();
        let failed = outcomes.iter().filter(|outcome| outcome.is_failed()).count();
        let vetoed = outcomes.iter().filter(|outcome| outcome.is_vetoed()).count();
        info!(entity = %self.reference(), written, failed, vetoed, "flushed metas");
        Ok(outcomes)
    }

    fn fire(&self, event: MetaEvent, key: &str) -> Result<Verdict> {
        let record = self
            .metas
            .get()
            .and_then(|metas| metas.record(key))
            .ok_or_else(|| MetableError::Invariant(format!("no meta record for {}", key)))?;
        self.schema
            .events()
            .fire(event, self, record, self.db.dispatcher())
    }
    fn advise(&self, event: MetaEvent, outcome: &mut FlushOutcome) {
        match self.fire(event, &outcome.key) {
            Ok(Verdict::Veto) => {
                warn!(key = %outcome.key, event = %event, "veto after the write has no effect");
                outcome.advisory_vetoes.push(event);
            }
            Ok(Verdict::Continue) => {}
            Err(e) => {
                warn!(key = %outcome.key, event = %event, error = %e, "event dispatch failed");
                outcome.advisory_errors.push((event, e));
            }
        }
    }
    fn forget_record(&mut self, key: &str) {
        if let Some(metas) = self.metas.get_mut() {
            metas.remove(key);
        }
    }

    fn flush_write(&mut self, key: String, create: bool, owner_id: i64) -> FlushOutcome {
        let (pre, post, status) = if create {
            (MetaEvent::Creating, MetaEvent::Created, FlushStatus::Created)
        } else {
            (MetaEvent::Updating, MetaEvent::Updated, FlushStatus::Updated)
        };
        for event in [MetaEvent::Saving, pre] {
            match self.fire(event, &key) {
                Ok(Verdict::Continue) => {}
                Ok(Verdict::Veto) => {
                    warn!(key = %key, event = %event, "meta write vetoed");
                    return FlushOutcome::new(key, FlushStatus::Vetoed(event));
                }
                Err(e) => return FlushOutcome::new(key, FlushStatus::Failed(e)),
            }
        }
        let now = Utc::now().naive_utc();
        let row = match self.metas.get_mut().and_then(|metas| metas.record_mut(&key)) {
            Some(record) => {
                record.stamp_owner(owner_id);
                record.to_row(owner_id, now)
            }
            None => {
                let e = MetableError::Invariant(format!("no meta record for {}", key));
                return FlushOutcome::new(key, FlushStatus::Failed(e));
            }
        };
        let meta_table = self.schema.meta_table();
        let owner_key = self.schema.meta_key_name();
        let written = self.db.store(|store| {
            if create {
                store.insert_meta(&meta_table, &owner_key, &row)
            } else {
                store.update_meta(&meta_table, &owner_key, &row)
            }
        });
        let id = match written {
            Ok(id) => id,
            Err(e) => {
                warn!(key = %key, error = %e, "meta write failed");
                return FlushOutcome::new(key, FlushStatus::Failed(e));
            }
        };
        if let Some(record) = self.metas.get_mut().and_then(|metas| metas.record_mut(&key)) {
            record.mark_persisted(id, now);
        }
        debug!(key = %key, id, created = create, "meta written");
        let mut outcome = FlushOutcome::new(key, status);
        self.advise(post, &mut outcome);
        self.advise(MetaEvent::Saved, &mut outcome);
        outcome
    }

    fn flush_delete(&mut self, key: String) -> FlushOutcome {
        match self.fire(MetaEvent::Deleting, &key) {
            Ok(Verdict::Continue) => {}
            Ok(Verdict::Veto) => {
                warn!(key = %key, "meta deletion vetoed");
                return FlushOutcome::new(key, FlushStatus::Vetoed(MetaEvent::Deleting));
            }
            Err(e) => return FlushOutcome::new(key, FlushStatus::Failed(e)),
        }
        let id = self
            .metas
            .get()
            .and_then(|metas| metas.record(&key))
            .and_then(MetaRecord::id);
        if let Some(id) = id {
            let meta_table = self.schema.meta_table();
            if let Err(e) = self.db.store(|store| store.delete_meta(&meta_table, id)) {
                warn!(key = %key, error = %e, "meta deletion failed");
                return FlushOutcome::new(key, FlushStatus::Failed(e));
            }
        }
        debug!(key = %key, "meta deleted");
        let mut outcome = FlushOutcome::new(key, FlushStatus::Deleted);
        self.advise(MetaEvent::Deleted, &mut outcome);
        self.forget_record(&outcome.key);
        outcome
    }

    /// Removes the native row together with its meta rows. Returns false when
    /// there was nothing stored.
    pub fn delete(&mut self) -> Result<bool> {
        let (true, Some(id)) = (self.exists, self.id) else {
            return Ok(false);
        };
        let table = self.schema.table().to_owned();
        let primary_key = self.schema.primary_key().to_owned();
        let meta_table = self.schema.meta_table();
        let owner_key = self.schema.meta_key_name();
        let removed = self.db.store(|store| {
            let removed = store.delete_metas(&meta_table, &owner_key, id)?;
            store.delete(&table, &primary_key, id)?;
            Ok(removed)
        })?;
        self.exists = false;
        self.metas = OnceLock::new();
        info!(entity = %self.reference(), metas = removed, "deleted");
        Ok(true)
    }

    /// Native attributes, plus `meta_data` unless the type hides it.
    pub fn to_json(&self) -> Result<Json> {
        let mut object: Map<String, Json> = self
            .attributes
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        if !self.schema.hides_meta() {
            let metas: Map<String, Json> = self
                .all_metas()?
                .into_iter()
                .map(|(key, value)| (key, value.to_json()))
                .collect();
            object.insert(META_DATA_KEY.to_owned(), Json::Object(metas));
        }
        Ok(Json::Object(object))
    }
}

fn expand(keys: &[&str]) -> Vec<String> {
    keys.iter().flat_map(|keys| split_keys(keys)).collect()
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &self.type_name())
            .field("id", &self.id)
            .field("exists", &self.exists)
            .field("attributes", &self.attributes)
            .field("metas", &self.metas.get())
            .finish()
    }
}

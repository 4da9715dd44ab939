//! The per-entity set of meta attribute records.
use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use chrono::NaiveDateTime;
use lazy_static::lazy_static;
use regex::Regex;
use seahash::SeaHasher;
use tracing::{debug, trace};

use crate::datatype::{Encoded, TypeTag, Value, ValueCodec};
use crate::error::{MetableError, Result};
use crate::events::MetaEvent;
use crate::persist::MetaRow;
use crate::reference::{ModelLoader, ReferenceCache, ReferenceResolver};

pub type KeyHasher = BuildHasherDefault<SeaHasher>;

lazy_static! {
    static ref KEY_SEPARATOR: Regex =
        Regex::new(r"\s*[,|]\s*").expect("key separator pattern compiles");
}

/// Meta keys are case insensitive.
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

/// Splits `"a, b|c"` into normalized keys, dropping empty segments.
pub fn split_keys(keys: &str) -> Vec<String> {
    KEY_SEPARATOR
        .split(keys.trim())
        .filter(|key| !key.is_empty())
        .map(normalize_key)
        .collect()
}

/// One meta attribute: a key, its encoded value and its persistence state.
#[derive(Debug, Clone)]
pub struct MetaRecord {
    id: Option<i64>,
    owner_id: Option<i64>,
    key: String,
    type_tag: TypeTag,
    raw: Option<String>,
    // what the store holds for this record, if anything
    persisted: Option<Encoded>,
    marked_for_deletion: bool,
    created_at: Option<NaiveDateTime>,
    updated_at: Option<NaiveDateTime>,
}

impl MetaRecord {
    pub(crate) fn new(key: String, (type_tag, raw): Encoded) -> Self {
        Self {
            id: None,
            owner_id: None,
            key,
            type_tag,
            raw,
            persisted: None,
            marked_for_deletion: false,
            created_at: None,
            updated_at: None,
        }
    }
    pub(crate) fn hydrate(row: MetaRow) -> Self {
        Self {
            id: row.id,
            owner_id: Some(row.owner_id),
            key: normalize_key(&row.key),
            type_tag: row.type_tag,
            persisted: Some((row.type_tag, row.value.clone())),
            raw: row.value,
            marked_for_deletion: false,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
    pub fn id(&self) -> Option<i64> {
        self.id
    }
    pub fn owner_id(&self) -> Option<i64> {
        self.owner_id
    }
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }
    pub fn raw_value(&self) -> Option<&str> {
        self.raw.as_deref()
    }
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.created_at
    }
    pub fn updated_at(&self) -> Option<NaiveDateTime> {
        self.updated_at
    }
    /// True once the record has a persisted counterpart.
    pub fn exists(&self) -> bool {
        self.persisted.is_some()
    }
    pub fn is_dirty(&self) -> bool {
        match &self.persisted {
            None => true,
            Some((tag, raw)) => *tag != self.type_tag || *raw != self.raw,
        }
    }
    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }
    pub(crate) fn mark_for_deletion(&mut self) {
        self.marked_for_deletion = true;
    }
    pub(crate) fn assign(&mut self, (type_tag, raw): Encoded) {
        self.marked_for_deletion = false;
        self.type_tag = type_tag;
        self.raw = raw;
    }
    pub(crate) fn stamp_owner(&mut self, owner_id: i64) {
        self.owner_id = Some(owner_id);
    }
    pub(crate) fn to_row(&self, owner_id: i64, now: NaiveDateTime) -> MetaRow {
        MetaRow {
            id: self.id,
            owner_id,
            key: self.key.clone(),
            type_tag: self.type_tag,
            value: self.raw.clone(),
            created_at: self.created_at.or(Some(now)),
            updated_at: Some(now),
        }
    }
    pub(crate) fn mark_persisted(&mut self, id: i64, now: NaiveDateTime) {
        self.id = Some(id);
        self.persisted = Some((self.type_tag, self.raw.clone()));
        self.created_at = self.created_at.or(Some(now));
        self.updated_at = Some(now);
    }
}

/// Declared fallback values per meta key, shared by every entity of a type.
#[derive(Debug, Clone, Default)]
pub struct DefaultValues {
    values: HashMap<String, Value, KeyHasher>,
}

impl DefaultValues {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        self.values.insert(normalize_key(key), value)
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(&normalize_key(key))
    }
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&normalize_key(key))
    }
    /// Strict comparison against the declared default, if there is one.
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        self.get(key).is_some_and(|default| default == value)
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What flushing will do with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    Skip,
    Create,
    Update,
    Delete,
    /// Marked for deletion but never persisted, so it is dropped silently.
    Discard,
}

#[derive(Debug)]
pub enum FlushStatus {
    Created,
    Updated,
    Deleted,
    Skipped,
    Vetoed(MetaEvent),
    Failed(MetableError),
}

/// Per-key result of flushing a meta set.
#[derive(Debug)]
pub struct FlushOutcome {
    pub key: String,
    pub status: FlushStatus,
    /// Post events whose handlers returned a veto after the write happened.
    pub advisory_vetoes: Vec<MetaEvent>,
    /// Post events whose dispatch failed after the write happened.
    pub advisory_errors: Vec<(MetaEvent, MetableError)>,
}

impl FlushOutcome {
    pub fn new(key: String, status: FlushStatus) -> Self {
        Self {
            key,
            status,
            advisory_vetoes: Vec::new(),
            advisory_errors: Vec::new(),
        }
    }
    pub fn is_failed(&self) -> bool {
        matches!(self.status, FlushStatus::Failed(_))
    }
    pub fn is_vetoed(&self) -> bool {
        matches!(self.status, FlushStatus::Vetoed(_))
    }
    pub fn wrote(&self) -> bool {
        matches!(
            self.status,
            FlushStatus::Created | FlushStatus::Updated | FlushStatus::Deleted
        )
    }
}

/// Records keyed by normalized key, in insertion order.
pub struct MetaSet {
    records: Vec<MetaRecord>,
    index: HashMap<String, usize, KeyHasher>,
    defaults: Arc<DefaultValues>,
    codec: Arc<dyn ValueCodec>,
    cache: ReferenceCache,
}

impl MetaSet {
    pub fn new(defaults: Arc<DefaultValues>, codec: Arc<dyn ValueCodec>) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::default(),
            defaults,
            codec,
            cache: ReferenceCache::new(),
        }
    }
    /// Builds the set from stored rows. A key stored more than once keeps the
    /// last row read.
    pub fn hydrate(
        defaults: Arc<DefaultValues>,
        codec: Arc<dyn ValueCodec>,
        rows: Vec<MetaRow>,
    ) -> Self {
        let mut set = Self::new(defaults, codec);
        for row in rows {
            let record = MetaRecord::hydrate(row);
            match set.index.get(record.key()) {
                Some(&position) => set.records[position] = record,
                None => {
                    set.index.insert(record.key().to_owned(), set.records.len());
                    set.records.push(record);
                }
            }
        }
        set
    }
    pub fn defaults(&self) -> &DefaultValues {
        &self.defaults
    }
    /// Visible record for the key, ignoring those marked for deletion.
    pub fn get(&self, key: &str) -> Option<&MetaRecord> {
        self.record(key).filter(|record| !record.is_marked_for_deletion())
    }
    pub(crate) fn record(&self, key: &str) -> Option<&MetaRecord> {
        self.index
            .get(&normalize_key(key))
            .map(|&position| &self.records[position])
    }
    pub(crate) fn record_mut(&mut self, key: &str) -> Option<&mut MetaRecord> {
        match self.index.get(&normalize_key(key)) {
            Some(&position) => Some(&mut self.records[position]),
            None => None,
        }
    }
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
    pub fn len(&self) -> usize {
        self.visible().count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn visible(&self) -> impl Iterator<Item = &MetaRecord> {
        self.records.iter().filter(|record| !record.is_marked_for_deletion())
    }
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.visible().map(MetaRecord::key)
    }
    fn decode(&self, record: &MetaRecord, loader: &dyn ModelLoader) -> Result<Value> {
        let refs = ReferenceResolver::new(&self.cache, loader);
        self.codec.decode(record.type_tag(), record.raw_value(), &refs)
    }
    /// Decoded value of a visible record.
    pub fn value(&self, key: &str, loader: &dyn ModelLoader) -> Result<Option<Value>> {
        match self.get(key) {
            Some(record) => self.decode(record, loader).map(Some),
            None => Ok(None),
        }
    }
    /// Decoded value, falling back to the declared default.
    pub fn value_or_default(&self, key: &str, loader: &dyn ModelLoader) -> Result<Option<Value>> {
        match self.value(key, loader)? {
            Some(value) => Ok(Some(value)),
            None => Ok(self.defaults.get(key).cloned()),
        }
    }
    pub fn all_visible(&self, loader: &dyn ModelLoader) -> Result<Vec<(String, Value)>> {
        self.visible()
            .map(|record| Ok((record.key().to_owned(), self.decode(record, loader)?)))
            .collect()
    }
    /// Sets the value for a key. A value equal to the declared default removes
    /// the override instead of storing it.
    pub fn set(&mut self, key: &str, value: Value, loader: &dyn ModelLoader) -> Result<()> {
        let key = normalize_key(key);
        if self.defaults.matches(&key, &value) {
            debug!(key = %key, "value equals the default, dropping the override");
            self.unset(&key);
            return Ok(());
        }
        let encoded = {
            let refs = ReferenceResolver::new(&self.cache, loader);
            self.codec.encode(&value, &refs)?
        };
        match self.index.get(&key) {
            Some(&position) => self.records[position].assign(encoded),
            None => {
                trace!(key = %key, "new meta record");
                self.index.insert(key.clone(), self.records.len());
                self.records.push(MetaRecord::new(key, encoded));
            }
        }
        Ok(())
    }
    /// Marks the record for deletion; absent keys are ignored.
    pub fn unset(&mut self, key: &str) {
        if let Some(record) = self.record_mut(key) {
            record.mark_for_deletion();
        }
    }
    /// With no keys, whether any record is dirty or marked for deletion.
    /// Otherwise whether any of the named records is.
    pub fn is_dirty(&self, keys: &[&str]) -> bool {
        let pending = |record: &MetaRecord| record.is_marked_for_deletion() || record.is_dirty();
        if keys.is_empty() {
            self.records.iter().any(pending)
        } else {
            keys.iter()
                .filter_map(|key| self.record(key))
                .any(pending)
        }
    }
    pub(crate) fn plan(&self) -> Vec<(String, FlushAction)> {
        self.records
            .iter()
            .map(|record| {
                let action = match (record.is_marked_for_deletion(), record.exists()) {
                    (true, true) => FlushAction::Delete,
                    (true, false) => FlushAction::Discard,
                    (false, false) => FlushAction::Create,
                    (false, true) if record.is_dirty() => FlushAction::Update,
                    (false, true) => FlushAction::Skip,
                };
                (record.key().to_owned(), action)
            })
            .collect()
    }
    pub(crate) fn remove(&mut self, key: &str) -> Option<MetaRecord> {
        let position = self.index.remove(&normalize_key(key))?;
        let record = self.records.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Some(record)
    }
    /// Drops a cached model reference so the next read reloads it.
    pub fn forget_reference(&self, type_name: &str, id: i64) -> Result<bool> {
        self.cache.forget(type_name, id)
    }
    pub fn references(&self) -> &ReferenceCache {
        &self.cache
    }
}

impl fmt::Debug for MetaSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MetaSet")
            .field("records", &self.records)
            .field("defaults", &self.defaults)
            .field("references", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::JsonCodec;
    use crate::entity::Entity;

    struct NoModels;
    impl ModelLoader for NoModels {
        fn knows(&self, _type_name: &str) -> bool {
            false
        }
        fn load(&self, type_name: &str, id: i64) -> Result<Entity> {
            Err(MetableError::NotFound { type_name: type_name.to_owned(), id })
        }
        fn instantiate(&self, type_name: &str) -> Result<Entity> {
            Err(MetableError::UnknownType(type_name.to_owned()))
        }
    }

    fn empty_set() -> MetaSet {
        let mut defaults = DefaultValues::new();
        defaults.insert("Color", Value::from("red"));
        MetaSet::new(Arc::new(defaults), Arc::new(JsonCodec))
    }

    fn row(id: i64, key: &str, tag: TypeTag, value: &str) -> MetaRow {
        MetaRow {
            id: Some(id),
            owner_id: 7,
            key: key.to_owned(),
            type_tag: tag,
            value: Some(value.to_owned()),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn keys_are_case_insensitive() {
        let mut set = empty_set();
        set.set("Nickname", Value::from("Ace"), &NoModels).unwrap();
        assert!(set.has("NICKNAME"));
        assert_eq!(set.get("nickname").unwrap().key(), "nickname");
        assert_eq!(set.value("nickName", &NoModels).unwrap(), Some(Value::from("Ace")));
    }

    #[test]
    fn setting_the_default_drops_the_override() {
        let mut set = empty_set();
        set.set("color", Value::from("blue"), &NoModels).unwrap();
        assert!(set.has("color"));
        set.set("color", Value::from("red"), &NoModels).unwrap();
        assert!(!set.has("color"));
        assert_eq!(set.value_or_default("color", &NoModels).unwrap(), Some(Value::from("red")));
        // a never stored override leaves nothing behind to flush
        assert_eq!(set.plan(), vec![("color".to_owned(), FlushAction::Discard)]);
    }

    #[test]
    fn unset_hides_until_set_again() {
        let mut set = empty_set();
        set.set("size", Value::from(3), &NoModels).unwrap();
        set.unset("size");
        assert!(!set.has("size"));
        assert!(set.record("size").is_some());
        set.set("size", Value::from(4), &NoModels).unwrap();
        assert!(set.has("size"));
        assert!(!set.get("size").unwrap().is_marked_for_deletion());
        set.unset("missing");
    }

    #[test]
    fn hydrated_records_are_clean() {
        let rows = vec![
            row(1, "Size", TypeTag::Int, "3"),
            row(2, "name", TypeTag::String, "old"),
            row(3, "name", TypeTag::String, "new"),
        ];
        let set = MetaSet::hydrate(Arc::new(DefaultValues::new()), Arc::new(JsonCodec), rows);
        assert_eq!(set.len(), 2);
        assert!(!set.is_dirty(&[]));
        assert_eq!(set.value("name", &NoModels).unwrap(), Some(Value::from("new")));
        assert_eq!(set.value("size", &NoModels).unwrap(), Some(Value::from(3)));
    }

    #[test]
    fn dirtiness_tracks_the_stored_state() {
        let rows = vec![row(1, "size", TypeTag::Int, "3"), row(2, "tone", TypeTag::String, "soft")];
        let mut set = MetaSet::hydrate(Arc::new(DefaultValues::new()), Arc::new(JsonCodec), rows);
        set.set("size", Value::from(3), &NoModels).unwrap();
        assert!(!set.is_dirty(&["size"]));
        set.set("size", Value::from("3"), &NoModels).unwrap();
        assert!(set.is_dirty(&["size"]));
        assert!(!set.is_dirty(&["tone"]));
        set.unset("tone");
        assert!(set.is_dirty(&["tone"]));
        set.set("fresh", Value::from(true), &NoModels).unwrap();
        assert_eq!(
            set.plan(),
            vec![
                ("size".to_owned(), FlushAction::Update),
                ("tone".to_owned(), FlushAction::Delete),
                ("fresh".to_owned(), FlushAction::Create),
            ]
        );
    }

    #[test]
    fn unsetting_a_new_record_keeps_it_dirty() {
        let mut set = empty_set();
        set.set("a", Value::from(1), &NoModels).unwrap();
        set.unset("a");
        assert!(set.is_dirty(&[]));
        assert!(set.is_dirty(&["a"]));
        assert_eq!(set.plan(), vec![("a".to_owned(), FlushAction::Discard)]);
    }

    #[test]
    fn removing_keeps_the_index_consistent() {
        let mut set = empty_set();
        for key in ["a", "b", "c"] {
            set.set(key, Value::from(key), &NoModels).unwrap();
        }
        assert!(set.remove("a").is_some());
        assert_eq!(set.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(set.value("c", &NoModels).unwrap(), Some(Value::from("c")));
    }

    #[test]
    fn splitting_key_lists() {
        assert_eq!(split_keys("Foo, bar|baz"), vec!["foo", "bar", "baz"]);
        assert_eq!(split_keys("single"), vec!["single"]);
        assert!(split_keys("  ").is_empty());
    }
}

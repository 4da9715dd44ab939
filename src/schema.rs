//! Entity type declarations: storage names, defaults, hooks and handlers.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::datatype::{JsonCodec, Value, ValueCodec};
use crate::entity::Entity;
use crate::error::Result;
use crate::events::{AggregateEvent, EventBus, MetaEvent, MetaObserver, Verdict};
use crate::meta::{DefaultValues, KeyHasher, MetaRecord, normalize_key};

pub const DEFAULT_PRIMARY_KEY: &str = "id";
pub const DEFAULT_META_SUFFIX: &str = "_meta";

/// Transforms a decoded meta value on its way out.
pub type Accessor = Arc<dyn Fn(Value) -> Value + Send + Sync>;
/// Takes over assignment of a meta key.
pub type Mutator = Arc<dyn Fn(&mut Entity, Value) -> Result<()> + Send + Sync>;

/// Conversion applied to a native attribute. A key with a cast is always
/// treated as native.
pub trait AttributeCast: Send + Sync {
    fn get(&self, key: &str, stored: Value) -> Result<Value>;
    fn set(&self, key: &str, value: Value) -> Result<Value>;
}

/// Describes one kind of entity. Built once and registered with a
/// [`Database`](crate::Database), after which it is shared read only.
#[derive(Clone)]
pub struct EntityType {
    name: String,
    table: String,
    primary_key: String,
    meta_table: Option<String>,
    meta_key_name: Option<String>,
    fluent_meta: bool,
    hide_meta: bool,
    relations: HashSet<String, KeyHasher>,
    casts: HashMap<String, Arc<dyn AttributeCast>, KeyHasher>,
    accessors: HashMap<String, Accessor, KeyHasher>,
    mutators: HashMap<String, Mutator, KeyHasher>,
    defaults: Arc<DefaultValues>,
    events: EventBus,
    codec: Arc<dyn ValueCodec>,
}

impl EntityType {
    /// A type stored in `table` and named after it.
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            name: table.clone(),
            table,
            primary_key: DEFAULT_PRIMARY_KEY.to_owned(),
            meta_table: None,
            meta_key_name: None,
            fluent_meta: true,
            hide_meta: false,
            relations: HashSet::default(),
            casts: HashMap::default(),
            accessors: HashMap::default(),
            mutators: HashMap::default(),
            defaults: Arc::new(DefaultValues::new()),
            events: EventBus::new(),
            codec: Arc::new(JsonCodec),
        }
    }
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }
    pub fn with_meta_table(mut self, meta_table: impl Into<String>) -> Self {
        self.meta_table = Some(meta_table.into());
        self
    }
    pub fn with_meta_key_name(mut self, meta_key_name: impl Into<String>) -> Self {
        self.meta_key_name = Some(meta_key_name.into());
        self
    }
    /// With fluent meta off, plain attribute access never reaches metas.
    pub fn with_fluent_meta(mut self, fluent: bool) -> Self {
        self.fluent_meta = fluent;
        self
    }
    /// Leaves `meta_data` out of serialized entities.
    pub fn with_hidden_meta(mut self, hidden: bool) -> Self {
        self.hide_meta = hidden;
        self
    }
    pub fn with_relation(mut self, name: impl Into<String>) -> Self {
        self.relations.insert(name.into());
        self
    }
    pub fn with_cast(mut self, key: impl Into<String>, cast: impl AttributeCast + 'static) -> Self {
        self.casts.insert(key.into(), Arc::new(cast));
        self
    }
    pub fn with_accessor<F>(mut self, key: &str, accessor: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.accessors.insert(normalize_key(key), Arc::new(accessor));
        self
    }
    pub fn with_mutator<F>(mut self, key: &str, mutator: F) -> Self
    where
        F: Fn(&mut Entity, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.mutators.insert(normalize_key(key), Arc::new(mutator));
        self
    }
    pub fn with_default(mut self, key: &str, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.defaults).insert(key, value.into());
        self
    }
    pub fn on_meta<F>(mut self, event: MetaEvent, handler: F) -> Self
    where
        F: Fn(&Entity, &MetaRecord) -> Verdict + Send + Sync + 'static,
    {
        self.events.on(event, Arc::new(handler));
        self
    }
    pub fn on_aggregate<F>(mut self, event: AggregateEvent, handler: F) -> Self
    where
        F: Fn(&Entity) + Send + Sync + 'static,
    {
        self.events.on_aggregate(event, Arc::new(handler));
        self
    }
    pub fn with_observer(mut self, observer: impl MetaObserver + 'static) -> Self {
        self.events.observe(Arc::new(observer));
        self
    }
    pub fn with_codec(mut self, codec: impl ValueCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn table(&self) -> &str {
        &self.table
    }
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }
    /// `<table>_meta` unless overridden.
    /// Whether the meta table was named explicitly rather than derived.
    pub fn names_meta_table(&self) -> bool {
        self.meta_table.is_some()
    }
    pub fn meta_table(&self) -> String {
        self.meta_table
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.table, DEFAULT_META_SUFFIX))
    }
    /// Foreign key column in the meta table, `<singular table>_id` unless
    /// overridden.
    pub fn meta_key_name(&self) -> String {
        self.meta_key_name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", singular(&self.table), self.primary_key))
    }
    pub fn is_fluent(&self) -> bool {
        self.fluent_meta
    }
    pub fn hides_meta(&self) -> bool {
        self.hide_meta
    }
    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains(name)
    }
    pub fn cast(&self, key: &str) -> Option<&Arc<dyn AttributeCast>> {
        self.casts.get(key)
    }
    pub fn accessor(&self, key: &str) -> Option<&Accessor> {
        self.accessors.get(&normalize_key(key))
    }
    pub fn mutator(&self, key: &str) -> Option<&Mutator> {
        self.mutators.get(&normalize_key(key))
    }
    pub fn defaults(&self) -> &Arc<DefaultValues> {
        &self.defaults
    }
    pub fn has_default(&self, key: &str) -> bool {
        self.defaults.contains(key)
    }
    pub fn events(&self) -> &EventBus {
        &self.events
    }
    pub fn codec(&self) -> &Arc<dyn ValueCodec> {
        &self.codec
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("meta_table", &self.meta_table())
            .field("meta_key_name", &self.meta_key_name())
            .field("fluent_meta", &self.fluent_meta)
            .field("hide_meta", &self.hide_meta)
            .field("defaults", &self.defaults)
            .field("events", &self.events)
            .finish()
    }
}

fn singular(table: &str) -> &str {
    match table.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem,
        _ => table,
    }
}

//! Lifecycle events raised while meta records are flushed.
//!
//! Handlers are consulted in three tiers: closures registered on the entity
//! type, then observer objects, then the database wide [`Dispatcher`]. A pre
//! event (`metaSaving`, `metaCreating`, `metaUpdating`, `metaDeleting`) whose
//! handler answers [`Verdict::Veto`] stops the remaining handlers and skips
//! the write. Vetoes on post events come too late to stop anything and are
//! only reported.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use crate::entity::Entity;
use crate::error::Result;
use crate::meta::MetaRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaEvent {
    Creating,
    Created,
    Saving,
    Saved,
    Updating,
    Updated,
    Deleting,
    Deleted,
}

impl MetaEvent {
    pub const ALL: [MetaEvent; 8] = [
        MetaEvent::Creating,
        MetaEvent::Created,
        MetaEvent::Saving,
        MetaEvent::Saved,
        MetaEvent::Updating,
        MetaEvent::Updated,
        MetaEvent::Deleting,
        MetaEvent::Deleted,
    ];
    pub fn name(&self) -> &'static str {
        match self {
            MetaEvent::Creating => "metaCreating",
            MetaEvent::Created => "metaCreated",
            MetaEvent::Saving => "metaSaving",
            MetaEvent::Saved => "metaSaved",
            MetaEvent::Updating => "metaUpdating",
            MetaEvent::Updated => "metaUpdated",
            MetaEvent::Deleting => "metaDeleting",
            MetaEvent::Deleted => "metaDeleted",
        }
    }
    /// Pre events run before the write and may veto it.
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            MetaEvent::Creating | MetaEvent::Saving | MetaEvent::Updating | MetaEvent::Deleting
        )
    }
}

impl fmt::Display for MetaEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raised once per save of the owning entity, after its metas were flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateEvent {
    CreatedWithMetas,
    UpdatedWithMetas,
    SavedWithMetas,
}

impl AggregateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateEvent::CreatedWithMetas => "createdWithMetas",
            AggregateEvent::UpdatedWithMetas => "updatedWithMetas",
            AggregateEvent::SavedWithMetas => "savedWithMetas",
        }
    }
}

impl fmt::Display for AggregateEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Continue,
    Veto,
}

impl Verdict {
    pub fn is_veto(&self) -> bool {
        matches!(self, Verdict::Veto)
    }
}

pub type MetaHandler = Arc<dyn Fn(&Entity, &MetaRecord) -> Verdict + Send + Sync>;
pub type AggregateHandler = Arc<dyn Fn(&Entity) + Send + Sync>;

/// Object style handler. Every method defaults to doing nothing.
pub trait MetaObserver: Send + Sync {
    fn meta_creating(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn meta_created(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn meta_saving(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn meta_saved(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn meta_updating(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn meta_updated(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn meta_deleting(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn meta_deleted(&self, _entity: &Entity, _meta: &MetaRecord) -> Verdict {
        Verdict::Continue
    }
    fn created_with_metas(&self, _entity: &Entity) {}
    fn updated_with_metas(&self, _entity: &Entity) {}
    fn saved_with_metas(&self, _entity: &Entity) {}
}

fn observe(
    observer: &dyn MetaObserver,
    event: MetaEvent,
    entity: &Entity,
    meta: &MetaRecord,
) -> Verdict {
    match event {
        MetaEvent::Creating => observer.meta_creating(entity, meta),
        MetaEvent::Created => observer.meta_created(entity, meta),
        MetaEvent::Saving => observer.meta_saving(entity, meta),
        MetaEvent::Saved => observer.meta_saved(entity, meta),
        MetaEvent::Updating => observer.meta_updating(entity, meta),
        MetaEvent::Updated => observer.meta_updated(entity, meta),
        MetaEvent::Deleting => observer.meta_deleting(entity, meta),
        MetaEvent::Deleted => observer.meta_deleted(entity, meta),
    }
}

fn observe_aggregate(observer: &dyn MetaObserver, event: AggregateEvent, entity: &Entity) {
    match event {
        AggregateEvent::CreatedWithMetas => observer.created_with_metas(entity),
        AggregateEvent::UpdatedWithMetas => observer.updated_with_metas(entity),
        AggregateEvent::SavedWithMetas => observer.saved_with_metas(entity),
    }
}

/// What dispatcher listeners receive for a meta event.
pub struct MetaEventPayload<'a> {
    pub event: MetaEvent,
    pub entity: &'a Entity,
    pub meta: &'a MetaRecord,
}

pub struct AggregatePayload<'a> {
    pub event: AggregateEvent,
    pub entity: &'a Entity,
}

pub type Listener = Arc<dyn Fn(&MetaEventPayload<'_>) -> Verdict + Send + Sync>;
pub type AggregateListener = Arc<dyn Fn(&AggregatePayload<'_>) + Send + Sync>;

/// Listeners shared by every entity type of a database.
#[derive(Default)]
pub struct Dispatcher {
    listeners: RwLock<HashMap<MetaEvent, Vec<Listener>>>,
    aggregate_listeners: RwLock<HashMap<AggregateEvent, Vec<AggregateListener>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn listen<F>(&self, event: MetaEvent, listener: F) -> Result<()>
    where
        F: Fn(&MetaEventPayload<'_>) -> Verdict + Send + Sync + 'static,
    {
        self.listeners
            .write()?
            .entry(event)
            .or_default()
            .push(Arc::new(listener));
        Ok(())
    }
    pub fn listen_aggregate<F>(&self, event: AggregateEvent, listener: F) -> Result<()>
    where
        F: Fn(&AggregatePayload<'_>) + Send + Sync + 'static,
    {
        self.aggregate_listeners
            .write()?
            .entry(event)
            .or_default()
            .push(Arc::new(listener));
        Ok(())
    }
    /// Removes every listener of the event.
    pub fn forget(&self, event: MetaEvent) -> Result<()> {
        self.listeners.write()?.remove(&event);
        Ok(())
    }
    /// Calls listeners in registration order until one vetoes.
    pub fn until(&self, payload: &MetaEventPayload<'_>) -> Result<Verdict> {
        // cloned out so that listeners may register further listeners
        let listeners = self
            .listeners
            .read()?
            .get(&payload.event)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            if listener(payload).is_veto() {
                return Ok(Verdict::Veto);
            }
        }
        Ok(Verdict::Continue)
    }
    pub fn dispatch_aggregate(&self, payload: &AggregatePayload<'_>) -> Result<()> {
        let listeners = self
            .aggregate_listeners
            .read()?
            .get(&payload.event)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(payload);
        }
        Ok(())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let listeners: usize = self
            .listeners
            .read()
            .map(|l| l.values().map(Vec::len).sum())
            .unwrap_or(0);
        let aggregate_listeners: usize = self
            .aggregate_listeners
            .read()
            .map(|l| l.values().map(Vec::len).sum())
            .unwrap_or(0);
        f.debug_struct("Dispatcher")
            .field("listeners", &listeners)
            .field("aggregate_listeners", &aggregate_listeners)
            .finish()
    }
}

/// Handlers attached to one entity type.
#[derive(Default, Clone)]
pub struct EventBus {
    handlers: HashMap<MetaEvent, Vec<MetaHandler>>,
    aggregate_handlers: HashMap<AggregateEvent, Vec<AggregateHandler>>,
    observers: Vec<Arc<dyn MetaObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn on(&mut self, event: MetaEvent, handler: MetaHandler) {
        self.handlers.entry(event).or_default().push(handler);
    }
    pub fn on_aggregate(&mut self, event: AggregateEvent, handler: AggregateHandler) {
        self.aggregate_handlers.entry(event).or_default().push(handler);
    }
    pub fn observe(&mut self, observer: Arc<dyn MetaObserver>) {
        self.observers.push(observer);
    }
    pub fn fire(
        &self,
        event: MetaEvent,
        entity: &Entity,
        meta: &MetaRecord,
        dispatcher: &Dispatcher,
    ) -> Result<Verdict> {
        trace!(event = %event, key = meta.key(), "firing");
        for handler in self.handlers.get(&event).into_iter().flatten() {
            if handler(entity, meta).is_veto() {
                debug!(event = %event, key = meta.key(), "vetoed by closure");
                return Ok(Verdict::Veto);
            }
        }
        for observer in &self.observers {
            if observe(observer.as_ref(), event, entity, meta).is_veto() {
                debug!(event = %event, key = meta.key(), "vetoed by observer");
                return Ok(Verdict::Veto);
            }
        }
        let verdict = dispatcher.until(&MetaEventPayload { event, entity, meta })?;
        if verdict.is_veto() {
            debug!(event = %event, key = meta.key(), "vetoed by listener");
        }
        Ok(verdict)
    }
    pub fn notify(
        &self,
        event: AggregateEvent,
        entity: &Entity,
        dispatcher: &Dispatcher,
    ) -> Result<()> {
        trace!(event = %event, "notifying");
        for handler in self.aggregate_handlers.get(&event).into_iter().flatten() {
            handler(entity);
        }
        for observer in &self.observers {
            observe_aggregate(observer.as_ref(), event, entity);
        }
        dispatcher.dispatch_aggregate(&AggregatePayload { event, entity })
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.values().map(Vec::len).sum::<usize>())
            .field(
                "aggregate_handlers",
                &self.aggregate_handlers.values().map(Vec::len).sum::<usize>(),
            )
            .field("observers", &self.observers.len())
            .finish()
    }
}

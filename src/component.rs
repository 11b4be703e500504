//! Named, column-per-field component schemas.
//!
//! A [`ComponentDef`] is the user-facing, unregistered description of a
//! component: a name, an ordered list of `(field name, kind, default)`
//! triples, and whether it is a singleton. Registering one with a `World`
//! produces a [`ComponentInstance`]: a dense `component_id`, one shared
//! column per field (built through [`crate::field::handler_for`]), and the
//! `read`/`write`/`snapshot`/`copy` access methods of ยง4.4.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::{EntityBuffer, SINGLETON_ENTITY};
use crate::event::{EventBuffer, EventKind};
use crate::field::{handler_for, validate_default, validate_kind, ColumnStorage, FieldHandler, FieldKind, FieldValue};
use crate::EcsError;

/// A plain-record deep copy of a component's current field values
/// (ยง4.4 `snapshot`). Not a serialization format -- just a name -> value
/// map, safe to retain past the entity's lifetime.
pub type Record = HashMap<String, FieldValue>;

/// One field in a [`ComponentDef`]'s schema.
#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    kind: FieldKind,
    default: Option<FieldValue>,
}

/// An unregistered component description: name, schema, singleton flag.
///
/// Construct with [`ComponentDef::new`] and chain `.field(...)` calls; the
/// field order is preserved and becomes the column order on registration.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    name: String,
    is_singleton: bool,
    fields: Vec<FieldSpec>,
}

impl ComponentDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_singleton: false,
            fields: Vec::new(),
        }
    }

    /// Mark this definition as a singleton: capacity-1 columns, events use
    /// the reserved sentinel entity id (ยง3 Singletons).
    pub fn singleton(mut self) -> Self {
        self.is_singleton = true;
        self
    }

    /// Add a field with no declared default (the handler's own zero value
    /// is used -- see `FieldHandler::default_value`).
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    /// Add a field with an explicit default value.
    pub fn field_default(mut self, name: impl Into<String>, kind: FieldKind, default: FieldValue) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            default: Some(default),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_singleton(&self) -> bool {
        self.is_singleton
    }
}

/// A registered component: dense `component_id`, one shared column per
/// field, and the handlers that interpret them.
pub struct ComponentInstance {
    component_id: u32,
    name: String,
    is_singleton: bool,
    /// Declaration order; also the order fields were assigned to handlers.
    field_order: Vec<String>,
    field_index: HashMap<String, usize>,
    handlers: Vec<Box<dyn FieldHandler>>,
    columns: Vec<Arc<ColumnStorage>>,
    entities: Arc<EntityBuffer>,
    events: Arc<EventBuffer>,
}

impl std::fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("component_id", &self.component_id)
            .field("name", &self.name)
            .field("is_singleton", &self.is_singleton)
            .field("fields", &self.field_order)
            .finish()
    }
}

impl ComponentInstance {
    /// Realize a [`ComponentDef`] as a registered instance. Called once by
    /// `World` construction per definition; a second call for the same
    /// `component_id` is a caller bug, not guarded here (the `World`
    /// enforces `AlreadyInitialized` at the name-lookup level instead).
    pub fn register(
        def: &ComponentDef,
        component_id: u32,
        max_entities: u32,
        events: Arc<EventBuffer>,
        entities: Arc<EntityBuffer>,
    ) -> Result<Self, EcsError> {
        let capacity = if def.is_singleton { 1 } else { max_entities };
        let mut field_order = Vec::with_capacity(def.fields.len());
        let mut field_index = HashMap::with_capacity(def.fields.len());
        let mut handlers: Vec<Box<dyn FieldHandler>> = Vec::with_capacity(def.fields.len());
        let mut columns = Vec::with_capacity(def.fields.len());

        for spec in &def.fields {
            validate_kind(&spec.kind)?;
            if let Some(default) = &spec.default {
                validate_default(&spec.kind, default)?;
            }
            let handler = handler_for(&spec.kind, spec.default.clone());
            let column = Arc::new(handler.initialize_storage(capacity));
            field_index.insert(spec.name.clone(), field_order.len());
            field_order.push(spec.name.clone());
            handlers.push(handler);
            columns.push(column);
        }

        Ok(Self {
            component_id,
            name: def.name.clone(),
            is_singleton: def.is_singleton,
            field_order,
            field_index,
            handlers,
            columns,
            entities,
            events,
        })
    }

    pub fn component_id(&self) -> u32 {
        self.component_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_singleton(&self) -> bool {
        self.is_singleton
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_order
    }

    /// Column slot for `entity_id`: singletons always occupy slot 0.
    fn slot_for(&self, entity_id: u32) -> u32 {
        if self.is_singleton {
            0
        } else {
            entity_id
        }
    }

    /// Entity id to stamp on events raised by this component: the sentinel
    /// for singletons, the real id otherwise (ยง3 Singletons).
    fn event_entity(&self, entity_id: u32) -> u32 {
        if self.is_singleton {
            SINGLETON_ENTITY
        } else {
            entity_id
        }
    }

    fn field_idx(&self, field: &str) -> Option<usize> {
        self.field_index.get(field).copied()
    }

    /// A read-only view over one entity's (or the singleton's) fields.
    pub fn read(&self, entity_id: u32) -> ComponentRead<'_> {
        ComponentRead {
            instance: self,
            slot: self.slot_for(entity_id),
        }
    }

    /// A writable view; dropping it emits exactly one `CHANGED` event,
    /// tied to handle acquisition rather than individual setters (ยง4.4,
    /// ยง9 open question 2).
    pub fn write(&self, entity_id: u32) -> ComponentWrite<'_> {
        ComponentWrite {
            instance: self,
            slot: self.slot_for(entity_id),
            event_entity: self.event_entity(entity_id),
        }
    }

    /// Deep-copy every field's current value into a plain [`Record`].
    pub fn snapshot(&self, entity_id: u32) -> Record {
        let slot = self.slot_for(entity_id);
        let mut out = Record::with_capacity(self.field_order.len());
        for (idx, name) in self.field_order.iter().enumerate() {
            out.insert(name.clone(), self.handlers[idx].get_value(&self.columns[idx], slot, &self.entities));
        }
        out
    }

    /// Write `partial`'s fields, filling every field `partial` does not
    /// name with its declared default, then emit one `CHANGED` event.
    /// Matches the only caller in this crate (`add_component`, always an
    /// attach), so every invocation behaves as the spec's "first copy".
    pub fn copy(&self, entity_id: u32, partial: &Record) {
        let slot = self.slot_for(entity_id);
        for (idx, name) in self.field_order.iter().enumerate() {
            let value = partial
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.handlers[idx].default_value());
            self.handlers[idx].set_value(&self.columns[idx], slot, &value, &self.entities);
        }
        self.events
            .push_changed(self.event_entity(entity_id), self.component_id as u16);
    }
}

/// Read-only field access for one entity (or the singleton).
pub struct ComponentRead<'a> {
    instance: &'a ComponentInstance,
    slot: u32,
}

impl<'a> ComponentRead<'a> {
    pub fn get(&self, field: &str) -> Option<FieldValue> {
        let idx = self.instance.field_idx(field)?;
        Some(self.instance.handlers[idx].get_value(&self.instance.columns[idx], self.slot, &self.instance.entities))
    }
}

/// Writable field access for one entity (or the singleton). Emits one
/// `CHANGED` event when dropped, regardless of how many fields (if any)
/// were actually set through it -- the contract is tied to `write()`
/// acquisition, not individual setter calls (ยง4.4, ยง7).
pub struct ComponentWrite<'a> {
    instance: &'a ComponentInstance,
    slot: u32,
    event_entity: u32,
}

impl<'a> ComponentWrite<'a> {
    pub fn set(&self, field: &str, value: FieldValue) {
        if let Some(idx) = self.instance.field_idx(field) {
            self.instance.handlers[idx].set_value(&self.instance.columns[idx], self.slot, &value, &self.instance.entities);
        }
    }
}

impl<'a> Drop for ComponentWrite<'a> {
    fn drop(&mut self) {
        self.instance
            .events
            .push_changed(self.event_entity, self.instance.component_id as u16);
    }
}

/// Scan every live entity carrying `component` and return those whose
/// `field_name` ref column currently packs `target` (generation-aware;
/// reading through [`ComponentInstance::read`] self-nullifies stale refs
/// as a side effect, same as any other ref read -- ยง4.9 `get_backrefs`).
pub fn backrefs(component: &ComponentInstance, entities: &EntityBuffer, target: u32, field_name: &str) -> Vec<u32> {
    let mut out = Vec::new();
    for id in 0..entities.max_entities() {
        if !entities.has(id) || !entities.has_component(id, component.component_id()) {
            continue;
        }
        if let Some(FieldValue::Ref(Some(t))) = component.read(id).get(field_name) {
            if t == target {
                out.push(id);
            }
        }
    }
    out
}

/// Marker mask used by `World`/`Context` when pushing the
/// `COMPONENT_ADDED`/`COMPONENT_REMOVED` pair for a component id.
pub const COMPONENT_MEMBERSHIP_EVENTS: EventKind = EventKind::COMPONENT_ADDED.union(EventKind::COMPONENT_REMOVED);

//! A columnar, shared-memory, worker-parallel entity-component-system
//! runtime for an interactive-canvas editor.
//!
//! Entities are bare integer ids over a dense `[0, max_entities)` range,
//! each carrying a wrapping 7-bit generation and a membership bitmap.
//! Components are named schemas realized as one column per field, shared
//! across threads; systems read queries (bitmask matchers with
//! per-reader change tracking) and mutate components, which emit events
//! into a lock-free ring buffer. A [`world::World`] ties it all together:
//! registration, `execute()` (worker + main system dispatch and
//! reclamation), and `sync()` (subscriber notification).
//!
//! # Quick Start
//!
//! ```
//! use canvas_ecs::prelude::*;
//!
//! let position = ComponentDef::new("position")
//!     .field("x", FieldKind::Number(NumberKind::F32))
//!     .field("y", FieldKind::Number(NumberKind::F32));
//!
//! let world: World<()> = World::new(vec![position.clone()], WorldOptions::default()).unwrap();
//! let entity = world.create_entity().unwrap();
//! world.add_component(entity, &position, &Record::new()).unwrap();
//!
//! let snapshot = world.component("position").unwrap().snapshot(entity);
//! assert_eq!(snapshot.get("x"), Some(&FieldValue::Number(NumberValue::F32(0.0))));
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod entity;
#[allow(unsafe_code)]
pub mod field;
#[allow(unsafe_code)]
pub mod event;
#[allow(unsafe_code)]
pub mod pool;
pub mod query;
pub mod system;
pub mod worker;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations (ยง7).
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity id pool has no free slots left.
    #[error("entity pool exhausted")]
    PoolExhausted,

    /// A component with this name was registered twice on the same world.
    #[error("component '{name}' is already initialized")]
    AlreadyInitialized { name: String },

    /// A component/definition was used against a context that does not
    /// own an instance of it.
    #[error("component '{name}' is not registered on this world (registered: {available})")]
    NotRegistered { name: String, available: String },

    /// `removeComponent`/`hasComponent`/`addComponent` targeted an id
    /// that is not currently live.
    #[error("entity {id} does not exist")]
    EntityDoesNotExist { id: u32 },

    /// A singleton definition was used where a per-entity component was
    /// expected, or vice versa.
    #[error("singleton misuse on component '{name}'")]
    SingletonMisuse { name: String },

    /// A schema referenced a field kind the registry does not know, or
    /// an otherwise invalid field declaration (e.g. an enum with no
    /// values).
    #[error("unknown or invalid field kind: {detail}")]
    UnknownFieldKind { detail: String },

    /// A schema's declared default value does not match its field kind
    /// (e.g. a `Boolean` default on a `Number` field).
    #[error("invalid field encoding: {detail}")]
    FieldEncoding { detail: String },

    /// A reader's scan crossed the event ring buffer's retention window
    /// and lost events; `tracing::warn!` logs the same condition, this
    /// variant exists for callers that want to observe it programmatically.
    #[error("event reader {reader} missed events to ring buffer overflow")]
    EventOverflow { reader: u32 },

    /// A worker did not acknowledge its `init` message within the 5s
    /// budget (ยง4.8, ยง5); the worker is discarded.
    #[error("worker for module '{module}' timed out during init")]
    WorkerInitTimeout { module: String },

    /// A worker did not finish one `execute` invocation within the 30s
    /// budget; the worker is terminated and removed from the pool.
    #[error("worker for module '{module}' timed out during execute")]
    WorkerExecuteTimeout { module: String },

    /// A worker reported an error for the current dispatch.
    #[error("worker error: {message}")]
    WorkerError { message: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{backrefs, ComponentDef, ComponentInstance, Record};
    pub use crate::entity::{EntityBuffer, SINGLETON_ENTITY};
    pub use crate::event::{EventBuffer, EventKind, EventRecord};
    pub use crate::field::{FieldHandler, FieldKind, FieldValue, NumberKind, NumberValue};
    pub use crate::pool::Pool;
    pub use crate::query::{Bitmask, QueryDef, QueryInstance, QueryMasks, ReaderId};
    pub use crate::system::{Priority, System, SystemId, SystemKind, WorkerFn};
    pub use crate::worker::WorkerManager;
    pub use crate::world::{Context, SubscriptionId, SyncEvent, World, WorldOptions};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::sync::{Arc, Mutex};

    fn position_def() -> ComponentDef {
        ComponentDef::new("position")
            .field("x", FieldKind::Number(NumberKind::F32))
            .field("y", FieldKind::Number(NumberKind::F32))
    }

    fn ref_def() -> ComponentDef {
        ComponentDef::new("linked").field("target", FieldKind::Ref)
    }

    // -- S1: create / remove / recycle ---------------------------------

    #[test]
    fn create_remove_recycle_reuses_lowest_id_with_bumped_generation() {
        let mut world: World<()> = World::new(vec![position_def()], WorldOptions::new(()).max_entities(16)).unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(world.create_entity().unwrap());
        }
        let gen_before = world.shared_handle().entities().generation(ids[1]);

        world.remove_entity(ids[1]);
        world.execute(&mut []).unwrap();

        let recycled = world.create_entity().unwrap();
        assert_eq!(recycled, ids[1]);
        assert_eq!(world.shared_handle().entities().generation(recycled), gen_before.wrapping_add(1) & 0x7f);
    }

    // -- S3: stale ref self-nullifies -----------------------------------

    #[test]
    fn stale_ref_reads_null_after_target_reclaimed_and_slot_reused() {
        let mut world: World<()> = World::new(vec![ref_def()], WorldOptions::new(()).max_entities(8)).unwrap();
        let a = world.create_entity().unwrap();
        let b = world.create_entity().unwrap();
        world.add_component(a, &ref_def(), &Record::new()).unwrap();

        let linked = world.component("linked").unwrap();
        let mut partial = Record::new();
        partial.insert("target".to_owned(), FieldValue::Ref(Some(b)));
        linked.copy(a, &partial);

        world.remove_entity(b);
        world.execute(&mut []).unwrap();
        // One more execute to let reclamation observe the REMOVED event.
        world.execute(&mut []).unwrap();

        let _c = world.create_entity().unwrap(); // may or may not reuse b's slot

        let snapshot = linked.snapshot(a);
        assert_eq!(snapshot.get("target"), Some(&FieldValue::Ref(None)));
    }

    // -- subscribe/unsubscribe idempotence -------------------------------

    #[test]
    fn unsubscribe_stops_further_callback_invocations() {
        let mut world: World<()> = World::new(vec![position_def()], WorldOptions::default()).unwrap();
        let with = Bitmask::from_bits(&[0], 1);
        let def = QueryDef::new(with, Bitmask::empty(1), Bitmask::empty(1), Bitmask::empty(1));

        let calls = Arc::new(Mutex::new(0u32));
        let calls_clone = Arc::clone(&calls);
        let sub = world.subscribe(def, move |_event| {
            *calls_clone.lock().unwrap() += 1;
        });

        let e = world.create_entity().unwrap();
        world.add_component(e, &position_def(), &Record::new()).unwrap();
        world.sync();
        assert_eq!(*calls.lock().unwrap(), 1);

        world.unsubscribe(sub);
        let e2 = world.create_entity().unwrap();
        world.add_component(e2, &position_def(), &Record::new()).unwrap();
        world.sync();
        assert_eq!(*calls.lock().unwrap(), 1, "unsubscribed callback must not fire again");
    }

    #[test]
    fn sync_with_no_events_and_no_subscribers_is_a_no_op() {
        let mut world: World<()> = World::new(vec![position_def()], WorldOptions::default()).unwrap();
        let tick_before = world.tick();
        world.sync();
        assert_eq!(world.tick(), tick_before + 1);
    }

    // -- reclamation ------------------------------------------------------

    #[test]
    fn removed_entity_is_reclaimed_after_execute_observes_it() {
        let mut world: World<()> = World::new(Vec::new(), WorldOptions::new(()).max_entities(8)).unwrap();
        let e = world.create_entity().unwrap();
        assert!(world.shared_handle().entities().has(e));

        world.remove_entity(e);
        assert!(!world.shared_handle().entities().has(e));

        world.execute(&mut []).unwrap();
        // Data is wiped once reclaimed; membership bits are cleared.
        assert_eq!(world.shared_handle().entities().component_ids(e).len(), 0);
    }

    #[test]
    fn add_component_fails_on_dead_entity() {
        let mut world: World<()> = World::new(vec![position_def()], WorldOptions::default()).unwrap();
        let e = world.create_entity().unwrap();
        world.remove_entity(e);
        let result = world.add_component(e, &position_def(), &Record::new());
        assert!(matches!(result, Err(EcsError::EntityDoesNotExist { .. })));
    }

    #[test]
    fn pool_exhaustion_surfaces_as_error() {
        let world: World<()> = World::new(Vec::new(), WorldOptions::new(()).max_entities(2)).unwrap();
        // Capacity 2 means ids {1} are available (id 0 is reserved).
        world.create_entity().unwrap();
        assert!(matches!(world.create_entity(), Err(EcsError::PoolExhausted)));
    }
}

//! The top-level orchestrator: owns every shared buffer, runs systems,
//! and dispatches subscriber callbacks.
//!
//! `World` is deliberately thin. Almost everything it exposes --
//! `create_entity`, `add_component`, queries -- is implemented once as a
//! free function over [`WorldShared`] and then exposed twice: directly on
//! `World` for ad hoc/test use, and through [`Context`] for use inside a
//! system, whether that system runs on the main thread or on a worker
//! (ยง4.9).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::component::{backrefs, ComponentDef, ComponentInstance, Record};
use crate::entity::EntityBuffer;
use crate::event::{EventBuffer, EventKind};
use crate::pool::Pool;
use crate::query::{QueryDef, QueryInstance, ReaderId};
use crate::system::{Priority, System, SystemId, SystemKind, WorkerFn};
use crate::worker::WorkerManager;
use crate::EcsError;

/// Configuration accepted by [`World::new`] (ยง6).
pub struct WorldOptions<R> {
    /// Worker-thread pool size. `None` defaults to the number of logical
    /// CPUs.
    pub threads: Option<usize>,
    pub max_entities: u32,
    pub max_events: u32,
    pub resources: R,
}

impl<R> WorldOptions<R> {
    pub fn new(resources: R) -> Self {
        Self {
            threads: None,
            max_entities: 10_000,
            max_events: 131_072,
            resources,
        }
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn max_entities(mut self, max_entities: u32) -> Self {
        self.max_entities = max_entities;
        self
    }

    pub fn max_events(mut self, max_events: u32) -> Self {
        self.max_events = max_events;
        self
    }
}

impl<R: Default> Default for WorldOptions<R> {
    fn default() -> Self {
        Self::new(R::default())
    }
}

/// The world's shared, `Arc`-cloneable state: everything a worker thread
/// needs to reconstruct an equivalent view is reachable from here.
pub struct WorldShared<R> {
    pool: Arc<Pool>,
    entities: Arc<EntityBuffer>,
    events: Arc<EventBuffer>,
    components: Vec<Arc<ComponentInstance>>,
    component_names: HashMap<String, u32>,
    resources: Arc<R>,
    queries: Mutex<HashMap<(u32, (Vec<u32>, Vec<u32>, Vec<u32>)), QueryInstance>>,
}

impl<R> WorldShared<R> {
    /// Direct access to entity liveness/generation/membership, for tests
    /// and diagnostics that need to inspect state `Context` does not
    /// surface.
    pub fn entities(&self) -> &EntityBuffer {
        &self.entities
    }

    /// Direct access to the event log, e.g. to read `write_index()`.
    pub fn events(&self) -> &EventBuffer {
        &self.events
    }

    /// Names of every component registered on this world, for diagnostics
    /// (e.g. listing what *is* registered alongside a `NotRegistered` error).
    pub fn registered_names(&self) -> Vec<&str> {
        self.component_names.keys().map(String::as_str).collect()
    }

    fn component_by_name(&self, name: &str) -> Result<&ComponentInstance, EcsError> {
        let id = *self
            .component_names
            .get(name)
            .ok_or_else(|| self.not_registered(name))?;
        Ok(&self.components[id as usize])
    }

    fn not_registered(&self, name: &str) -> EcsError {
        EcsError::NotRegistered {
            name: name.to_owned(),
            available: self.registered_names().join(", "),
        }
    }
}

fn create_entity_impl<R>(shared: &WorldShared<R>) -> Result<u32, EcsError> {
    let id = shared.pool.get()?;
    shared.entities.create(id);
    shared.events.push_added(id);
    Ok(id)
}

/// Mark an entity dead and log its removal. Reclamation (returning the id
/// to the pool and wiping its membership bitmap) happens later, in
/// `World::execute`, once every system has had a chance to observe the
/// removal (ยง4.9, ยง8 S3).
fn remove_entity_impl<R>(shared: &WorldShared<R>, id: u32) {
    if shared.entities.has(id) {
        shared.entities.mark_dead(id);
        shared.events.push_removed(id);
    }
}

fn add_component_impl<R>(shared: &WorldShared<R>, id: u32, def: &ComponentDef, partial: &Record) -> Result<(), EcsError> {
    if !shared.entities.has(id) {
        return Err(EcsError::EntityDoesNotExist { id });
    }
    if def.is_singleton() {
        return Err(EcsError::SingletonMisuse { name: def.name().to_owned() });
    }
    let component_id = *shared
        .component_names
        .get(def.name())
        .ok_or_else(|| shared.not_registered(def.name()))?;
    shared.entities.add_component_to_entity(id, component_id);
    shared.components[component_id as usize].copy(id, partial);
    shared.events.push_component_added(id, component_id as u16);
    Ok(())
}

fn remove_component_impl<R>(shared: &WorldShared<R>, id: u32, def: &ComponentDef) -> Result<(), EcsError> {
    if !shared.entities.has(id) {
        return Err(EcsError::EntityDoesNotExist { id });
    }
    if def.is_singleton() {
        return Err(EcsError::SingletonMisuse { name: def.name().to_owned() });
    }
    let component_id = *shared
        .component_names
        .get(def.name())
        .ok_or_else(|| shared.not_registered(def.name()))?;
    shared.entities.remove_component_from_entity(id, component_id);
    shared.events.push_component_removed(id, component_id as u16);
    Ok(())
}

fn has_component_impl<R>(shared: &WorldShared<R>, id: u32, def: &ComponentDef) -> Result<bool, EcsError> {
    let component_id = *shared
        .component_names
        .get(def.name())
        .ok_or_else(|| shared.not_registered(def.name()))?;
    Ok(shared.entities.has(id) && shared.entities.has_component(id, component_id))
}

/// Reader id space is split so systems and subscribers never collide:
/// a system's reader id is derived from its `SystemId` and thread index,
/// subscribers get ids from a disjoint high range.
fn system_reader_id(id: SystemId, thread_index: usize) -> ReaderId {
    ReaderId(id.0.wrapping_mul(64).wrapping_add(thread_index as u32))
}

const SUBSCRIBER_READER_BASE: u32 = 0x8000_0000;

/// The argument handed to every system and to `Context::query_*`: a
/// handle on the shared world plus this call's reader identity, thread
/// index, and tick number (ยง4.9).
pub struct Context<R> {
    shared: Arc<WorldShared<R>>,
    reader_id: ReaderId,
    thread_index: usize,
    tick: u64,
}

impl<R> Context<R> {
    pub(crate) fn for_main(shared: Arc<WorldShared<R>>, reader_id: ReaderId, tick: u64) -> Self {
        Self {
            shared,
            reader_id,
            thread_index: 0,
            tick,
        }
    }

    pub(crate) fn for_worker(shared: Arc<WorldShared<R>>, reader_id: ReaderId, thread_index: usize, tick: u64) -> Self {
        Self {
            shared,
            reader_id,
            thread_index,
            tick,
        }
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn resources(&self) -> &R {
        &self.shared.resources
    }

    pub fn create_entity(&self) -> Result<u32, EcsError> {
        create_entity_impl(&self.shared)
    }

    pub fn remove_entity(&self, id: u32) {
        remove_entity_impl(&self.shared, id);
    }

    pub fn add_component(&self, id: u32, def: &ComponentDef, partial: &Record) -> Result<(), EcsError> {
        add_component_impl(&self.shared, id, def, partial)
    }

    pub fn remove_component(&self, id: u32, def: &ComponentDef) -> Result<(), EcsError> {
        remove_component_impl(&self.shared, id, def)
    }

    pub fn has_component(&self, id: u32, def: &ComponentDef) -> Result<bool, EcsError> {
        has_component_impl(&self.shared, id, def)
    }

    pub fn component(&self, name: &str) -> Result<&ComponentInstance, EcsError> {
        self.shared.component_by_name(name)
    }

    /// Scan every live entity carrying `def` whose `field_name` ref
    /// column currently points at `target` (ยง4.9).
    pub fn get_backrefs(&self, target: u32, def: &ComponentDef, field_name: &str) -> Result<Vec<u32>, EcsError> {
        let instance = self.shared.component_by_name(def.name())?;
        Ok(backrefs(instance, &self.shared.entities, target, field_name))
    }

    fn with_query_instance<F>(&self, def: QueryDef, f: F) -> Vec<u32>
    where
        F: FnOnce(&mut QueryInstance, &EntityBuffer, &EventBuffer, u64) -> Vec<u32>,
    {
        let key = (self.reader_id.0, def.cache_key());
        let initial_index = self.shared.events.write_index();
        let mut queries = self.shared.queries.lock().unwrap();
        let instance = queries
            .entry(key)
            .or_insert_with(|| QueryInstance::new(def, self.reader_id, initial_index));
        f(instance, &self.shared.entities, &self.shared.events, self.tick)
    }

    pub fn query_current(&self, def: QueryDef) -> Vec<u32> {
        self.with_query_instance(def, |inst, entities, _events, _tick| inst.current(entities).to_vec())
    }

    pub fn query_added(&self, def: QueryDef) -> Vec<u32> {
        self.with_query_instance(def, |inst, entities, events, tick| inst.added(entities, events, tick))
    }

    pub fn query_removed(&self, def: QueryDef) -> Vec<u32> {
        self.with_query_instance(def, |inst, entities, events, tick| inst.removed(entities, events, tick))
    }

    pub fn query_changed(&self, def: QueryDef) -> Vec<u32> {
        self.with_query_instance(def, |inst, entities, events, tick| inst.changed(entities, events, tick))
    }

    pub fn query_has(&self, def: QueryDef, id: u32) -> bool {
        let key = (self.reader_id.0, def.cache_key());
        let initial_index = self.shared.events.write_index();
        let mut queries = self.shared.queries.lock().unwrap();
        let instance = queries
            .entry(key)
            .or_insert_with(|| QueryInstance::new(def, self.reader_id, initial_index));
        instance.has(id)
    }

    /// Promote this reader's last overflow flag (set by `added`/`removed`/
    /// `changed`) into a catchable error, for callers that want `?` rather
    /// than polling a bool (ยง4.5, ยง7 `EcsError::EventOverflow`).
    pub fn query_overflow(&self, def: QueryDef) -> Result<(), EcsError> {
        let key = (self.reader_id.0, def.cache_key());
        let queries = self.shared.queries.lock().unwrap();
        let overflowed = queries.get(&key).map(|inst| inst.overflowed()).unwrap_or(false);
        if overflowed {
            Err(EcsError::EventOverflow { reader: self.reader_id.0 })
        } else {
            Ok(())
        }
    }
}

/// Handle returned by [`World::subscribe`], used to [`World::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u32);

/// The diff a subscriber callback receives at [`World::sync`] time.
#[derive(Debug, Clone, Default)]
pub struct SyncEvent {
    pub added: Vec<u32>,
    pub removed: Vec<u32>,
    pub changed: Vec<u32>,
}

struct Subscriber<R> {
    id: SubscriptionId,
    key: (u32, (Vec<u32>, Vec<u32>, Vec<u32>)),
    callback: Box<dyn FnMut(SyncEvent) + Send>,
    _marker: std::marker::PhantomData<R>,
}

/// The ECS runtime: entities, components, the event log, the worker
/// pool, subscribers, and the `tick` counter.
pub struct World<R: Send + Sync + 'static> {
    shared: Arc<WorldShared<R>>,
    workers: WorkerManager<R>,
    tick: u64,
    next_subscription_id: u32,
    subscribers: Vec<Subscriber<R>>,
    next_sync_queue: VecDeque<Box<dyn FnOnce(&mut Context<R>) + Send>>,
    /// Fallback lower bound for the reclamation window when no system's
    /// `prev_event_index` is available to supply one (no systems were
    /// passed to `execute`, ยง4.9 S1). Tracks the window forward so a
    /// later empty-system `execute` does not rescan already-reclaimed
    /// history.
    last_reclaim_index: u32,
}

impl<R: Send + Sync + 'static> World<R> {
    pub fn new(defs: Vec<ComponentDef>, options: WorldOptions<R>) -> Result<Self, EcsError> {
        let component_count = defs.len() as u32;
        let max_entities = options.max_entities;
        let pool = Arc::new(Pool::new(max_entities));
        let entities = Arc::new(EntityBuffer::new(max_entities, component_count));
        let events = Arc::new(EventBuffer::new(options.max_events));

        let mut components = Vec::with_capacity(defs.len());
        let mut component_names = HashMap::with_capacity(defs.len());
        for (idx, def) in defs.iter().enumerate() {
            let component_id = idx as u32;
            if component_names.contains_key(def.name()) {
                return Err(EcsError::AlreadyInitialized { name: def.name().to_owned() });
            }
            let instance = ComponentInstance::register(def, component_id, max_entities, Arc::clone(&events), Arc::clone(&entities))?;
            component_names.insert(def.name().to_owned(), component_id);
            components.push(Arc::new(instance));
        }

        let shared = Arc::new(WorldShared {
            pool,
            entities,
            events,
            components,
            component_names,
            resources: Arc::new(options.resources),
            queries: Mutex::new(HashMap::new()),
        });

        let threads = options
            .threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

        Ok(Self {
            shared,
            workers: WorkerManager::new(threads),
            tick: 0,
            next_subscription_id: 0,
            subscribers: Vec::new(),
            next_sync_queue: VecDeque::new(),
            last_reclaim_index: 0,
        })
    }

    /// Shared handle, for handing to a worker or for tests that need to
    /// exercise `WorkerManager` directly.
    pub fn shared_handle(&self) -> Arc<WorldShared<R>> {
        Arc::clone(&self.shared)
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn resources(&self) -> &R {
        &self.shared.resources
    }

    pub fn create_entity(&self) -> Result<u32, EcsError> {
        create_entity_impl(&self.shared)
    }

    pub fn remove_entity(&self, id: u32) {
        remove_entity_impl(&self.shared, id);
    }

    pub fn add_component(&self, id: u32, def: &ComponentDef, partial: &Record) -> Result<(), EcsError> {
        add_component_impl(&self.shared, id, def, partial)
    }

    pub fn remove_component(&self, id: u32, def: &ComponentDef) -> Result<(), EcsError> {
        remove_component_impl(&self.shared, id, def)
    }

    pub fn has_component(&self, id: u32, def: &ComponentDef) -> Result<bool, EcsError> {
        has_component_impl(&self.shared, id, def)
    }

    pub fn component(&self, name: &str) -> Result<&ComponentInstance, EcsError> {
        self.shared.component_by_name(name)
    }

    pub fn get_backrefs(&self, target: u32, def: &ComponentDef, field_name: &str) -> Result<Vec<u32>, EcsError> {
        let instance = self.shared.component_by_name(def.name())?;
        Ok(backrefs(instance, &self.shared.entities, target, field_name))
    }

    /// Names of every component registered on this world, for diagnostics.
    pub fn registered_names(&self) -> Vec<&str> {
        self.shared.registered_names()
    }

    /// Build a main-thread system, pinning its event-log markers to the
    /// write index as of right now (ยง9 open question 3).
    pub fn main_system(&self, id: SystemId, callback: impl FnMut(&mut Context<R>) + Send + 'static) -> System<R> {
        System::main(id, self.shared.events.write_index(), callback)
    }

    /// Build a worker-dispatched system, same marker-pinning rule.
    pub fn worker_system(
        &self,
        id: SystemId,
        module_path: impl Into<String>,
        threads: usize,
        priority: Priority,
        func: WorkerFn<R>,
    ) -> System<R> {
        System::worker(id, self.shared.events.write_index(), module_path, threads, priority, func)
    }

    /// Run one tick: advance every system's reclamation markers, dispatch
    /// worker systems (sorted high-to-low priority) without waiting, run
    /// main systems sequentially while those workers are in flight, join
    /// every worker, then reclaim ids for entities still dead at the end
    /// of the window any system could have observed them in (ยง4.9).
    pub fn execute(&mut self, systems: &mut [System<R>]) -> Result<(), EcsError> {
        self.tick += 1;
        tracing::debug!(tick = self.tick, system_count = systems.len(), "executing tick");
        let current_index = self.shared.events.write_index();
        for system in systems.iter_mut() {
            system.advance_markers(current_index);
        }

        let mut worker_idxs: Vec<usize> = systems
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_worker())
            .map(|(i, _)| i)
            .collect();
        worker_idxs.sort_by_key(|&i| systems[i].priority());

        let mut pending_all = Vec::new();
        for i in worker_idxs {
            let id = systems[i].id();
            if let SystemKind::Worker(w) = systems[i].kind_mut() {
                tracing::trace!(system = id.0, module = %w.module_path, threads = w.threads, "dispatching worker system");
                let reader_base = system_reader_id(id, 0).0;
                let pending = self.workers.dispatch(w, &self.shared, self.tick, reader_base)?;
                pending_all.extend(pending);
            }
        }

        for system in systems.iter_mut() {
            let id = system.id();
            if let SystemKind::Main(callback) = system.kind_mut() {
                let reader_id = system_reader_id(id, 0);
                let mut ctx = Context::for_main(Arc::clone(&self.shared), reader_id, self.tick);
                callback(&mut ctx);
            }
        }

        if let Err(err) = self.workers.join(pending_all) {
            tracing::error!(error = %err, "worker system failed during execute");
            return Err(err);
        }

        let min_prev = systems
            .iter()
            .map(|s| s.prev_event_index())
            .min()
            .unwrap_or(self.last_reclaim_index);
        let (dead, new_index, _) = self.shared.events.collect_entities_in_range(min_prev, EventKind::REMOVED, None);
        let reclaimed = dead.len();
        for id in dead {
            if !self.shared.entities.has(id) {
                self.shared.pool.free(id);
                self.shared.entities.delete(id);
            }
        }
        self.last_reclaim_index = new_index;
        tracing::trace!(tick = self.tick, reclaimed, "tick complete");

        Ok(())
    }

    /// Register a callback invoked at `sync()` time whenever `query`'s
    /// added/removed/changed sets are non-empty. Reader state is created
    /// eagerly, at the current write index, so only events from after
    /// this call are ever seen (ยง4.9).
    pub fn subscribe(&mut self, query: QueryDef, callback: impl FnMut(SyncEvent) + Send + 'static) -> SubscriptionId {
        let reader_id = ReaderId(SUBSCRIBER_READER_BASE + self.next_subscription_id);
        let current_index = self.shared.events.write_index();
        let key = (reader_id.0, query.cache_key());
        self.shared
            .queries
            .lock()
            .unwrap()
            .insert(key.clone(), QueryInstance::new(query, reader_id, current_index));

        let id = SubscriptionId(self.next_subscription_id);
        self.next_subscription_id += 1;
        self.subscribers.push(Subscriber {
            id,
            key,
            callback: Box::new(callback),
            _marker: std::marker::PhantomData,
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        if let Some(pos) = self.subscribers.iter().position(|s| s.id == id) {
            let sub = self.subscribers.remove(pos);
            self.shared.queries.lock().unwrap().remove(&sub.key);
        }
    }

    /// Queue a one-shot callback to run at the start of the next `sync()`
    /// call, in FIFO order, before subscriber diffs are computed.
    pub fn next_sync(&mut self, callback: impl FnOnce(&mut Context<R>) + Send + 'static) {
        self.next_sync_queue.push_back(Box::new(callback));
    }

    /// Advance the sync tick, drain queued one-shot callbacks, then
    /// invoke every subscriber whose added/removed/changed sets are not
    /// all empty.
    pub fn sync(&mut self) {
        self.tick += 1;

        let queue = std::mem::take(&mut self.next_sync_queue);
        for callback in queue {
            let mut ctx = Context::for_main(Arc::clone(&self.shared), ReaderId(SUBSCRIBER_READER_BASE - 1), self.tick);
            callback(&mut ctx);
        }

        for subscriber in &mut self.subscribers {
            let (added, removed, changed) = {
                let mut queries = self.shared.queries.lock().unwrap();
                let instance = queries.get_mut(&subscriber.key).expect("subscriber query registered at subscribe()");
                let added = instance.added(&self.shared.entities, &self.shared.events, self.tick);
                let removed = instance.removed(&self.shared.entities, &self.shared.events, self.tick);
                let changed = instance.changed(&self.shared.entities, &self.shared.events, self.tick);
                (added, removed, changed)
            };
            if !added.is_empty() || !removed.is_empty() || !changed.is_empty() {
                (subscriber.callback)(SyncEvent { added, removed, changed });
            }
        }
    }

    /// Terminate every worker thread. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.workers.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldKind, FieldValue, NumberKind, NumberValue};
    use crate::query::Bitmask;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn position_def() -> ComponentDef {
        ComponentDef::new("position")
            .field("x", FieldKind::Number(NumberKind::F32))
            .field("y", FieldKind::Number(NumberKind::F32))
    }

    fn mouse_def() -> ComponentDef {
        ComponentDef::new("mouse")
            .singleton()
            .field("x", FieldKind::Number(NumberKind::F32))
            .field("y", FieldKind::Number(NumberKind::F32))
    }

    /// S1: create/remove/recycle under a tight entity cap.
    #[test]
    fn s1_create_remove_recycle_within_capacity() {
        let world: World<()> = World::new(vec![position_def()], WorldOptions::new(()).max_entities(16)).unwrap();
        let mut ids = Vec::new();
        for _ in 0..15 {
            ids.push(world.create_entity().unwrap());
        }
        assert!(matches!(world.create_entity(), Err(EcsError::PoolExhausted)));

        for &id in &ids[..5] {
            world.remove_entity(id);
        }
        let mut systems: Vec<System<()>> = Vec::new();
        let mut world = world;
        world.execute(&mut systems).unwrap();

        for _ in 0..5 {
            world.create_entity().unwrap();
        }
        assert!(matches!(world.create_entity(), Err(EcsError::PoolExhausted)));
    }

    /// S2: singleton change is visible through subscribe/sync.
    #[test]
    fn s2_singleton_change_notifies_subscriber() {
        let mut world: World<()> = World::new(vec![mouse_def()], WorldOptions::default()).unwrap();
        let component_id = 0u32;
        let with = Bitmask::from_bits(&[component_id], 1);
        let tracking = Bitmask::from_bits(&[component_id], 1);
        let def = QueryDef::new(with, Bitmask::empty(1), Bitmask::empty(1), tracking);

        let seen: Arc<Mutex<Vec<SyncEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        world.subscribe(def, move |event| seen_clone.lock().unwrap().push(event));

        let mouse = world.component("mouse").unwrap();
        let mut partial = Record::new();
        partial.insert("x".to_owned(), FieldValue::Number(NumberValue::F32(3.0)));
        mouse.copy(0, &partial);

        world.sync();
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].changed, vec![crate::entity::SINGLETON_ENTITY]);
    }

    /// S4: a query matches only entities carrying every `with` component.
    #[test]
    fn s4_query_matches_entities_with_required_components() {
        let position_def = position_def();
        let velocity_def = ComponentDef::new("velocity").field("dx", FieldKind::Number(NumberKind::F32));
        let world: World<()> = World::new(vec![position_def.clone(), velocity_def.clone()], WorldOptions::default()).unwrap();

        let moving = world.create_entity().unwrap();
        world.add_component(moving, &position_def, &Record::new()).unwrap();
        world.add_component(moving, &velocity_def, &Record::new()).unwrap();

        let still = world.create_entity().unwrap();
        world.add_component(still, &position_def, &Record::new()).unwrap();

        let with = Bitmask::from_bits(&[0, 1], 2);
        let def = QueryDef::new(with, Bitmask::empty(2), Bitmask::empty(2), Bitmask::empty(2));
        let ctx = Context::for_main(world.shared_handle(), ReaderId(999), world.tick());
        let current = ctx.query_current(def);
        assert_eq!(current, vec![moving]);
    }

    /// S5: ring-buffer wrap still yields a coherent, clamped scan.
    #[test]
    fn s5_ring_wrap_on_small_event_buffer() {
        let world: World<()> = World::new(Vec::new(), WorldOptions::new(()).max_entities(16).max_events(4)).unwrap();
        for _ in 0..6 {
            world.create_entity().unwrap();
        }
        assert_eq!(world.shared_handle().events().write_index(), 6);
    }

    static PARTITION_CALLS: AtomicU32 = AtomicU32::new(0);

    fn bump_partition<R>(_ctx: &mut Context<R>) {
        PARTITION_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    /// S6: several worker systems run within one `execute()` call.
    #[test]
    fn s6_parallel_worker_systems_all_run() {
        PARTITION_CALLS.store(0, Ordering::SeqCst);
        let mut world: World<()> = World::new(Vec::new(), WorldOptions::new(()).threads(4)).unwrap();
        let mut systems = vec![
            world.worker_system(SystemId(1), "partition_a", 2, Priority::High, bump_partition),
            world.worker_system(SystemId(2), "partition_b", 2, Priority::Low, bump_partition),
        ];
        world.execute(&mut systems).unwrap();
        assert_eq!(PARTITION_CALLS.load(Ordering::SeqCst), 4);
        world.dispose();
    }

    #[test]
    fn add_component_rejects_singleton_via_helper() {
        let world: World<()> = World::new(vec![mouse_def()], WorldOptions::default()).unwrap();
        let id = world.create_entity().unwrap();
        let result = world.add_component(id, &mouse_def(), &Record::new());
        assert!(matches!(result, Err(EcsError::SingletonMisuse { .. })));
    }

    #[test]
    fn unknown_component_name_is_not_registered() {
        let world: World<()> = World::new(vec![position_def()], WorldOptions::default()).unwrap();
        let id = world.create_entity().unwrap();
        let ghost = ComponentDef::new("ghost").field("z", FieldKind::Number(NumberKind::F32));
        let result = world.add_component(id, &ghost, &Record::new());
        assert!(matches!(result, Err(EcsError::NotRegistered { .. })));
    }
}

//! System descriptors: main-thread closures and worker-dispatched functions.
//!
//! A [`System`] is either run sequentially on the calling thread
//! ([`SystemKind::Main`]) or handed to the [`crate::worker::WorkerManager`]
//! to run on one or more dedicated OS threads ([`SystemKind::Worker`]).
//! Every system carries a pair of event-log markers
//! (`prev_event_index`/`curr_event_index`) that `World::execute` uses to
//! decide the reclamation window each tick (ยง4.7, ยง4.9).

use crate::world::Context;

/// Scheduling priority for worker systems. Declaration order is the sort
/// order `World::execute` uses (`High` before `Normal` before `Low`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Stable identity for a system, used to derive its reader id
/// (`world_<n>_system_<id>`, ยง6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub u32);

/// A worker-dispatched function: a plain function pointer so it can be
/// sent to another OS thread without capturing thread-local state.
pub type WorkerFn<R> = fn(&mut Context<R>);

/// The worker-side description of a system: which module it is named
/// after (used purely as a diagnostic/pool key, ยง4.8), how many threads
/// should run it, and at what priority.
#[derive(Clone)]
pub struct WorkerSystem<R> {
    pub module_path: String,
    pub threads: usize,
    pub priority: Priority,
    pub func: WorkerFn<R>,
}

/// A system's execution strategy.
pub enum SystemKind<R> {
    Main(Box<dyn FnMut(&mut Context<R>) + Send>),
    Worker(WorkerSystem<R>),
}

/// A registered, stateful system: its id, its execution strategy, and the
/// event-log window it last reclaimed up to.
pub struct System<R> {
    id: SystemId,
    kind: SystemKind<R>,
    prev_event_index: u32,
    curr_event_index: u32,
}

impl<R> System<R> {
    /// Construct a main-thread system. `initial_event_index` pins
    /// `prev_event_index`/`curr_event_index` to the event log's write
    /// index at registration time, so the system's first tick does not
    /// rescan the log's entire history (ยง9 open question).
    pub fn main(
        id: SystemId,
        initial_event_index: u32,
        callback: impl FnMut(&mut Context<R>) + Send + 'static,
    ) -> Self {
        Self {
            id,
            kind: SystemKind::Main(Box::new(callback)),
            prev_event_index: initial_event_index,
            curr_event_index: initial_event_index,
        }
    }

    /// Construct a worker-dispatched system.
    pub fn worker(
        id: SystemId,
        initial_event_index: u32,
        module_path: impl Into<String>,
        threads: usize,
        priority: Priority,
        func: WorkerFn<R>,
    ) -> Self {
        Self {
            id,
            kind: SystemKind::Worker(WorkerSystem {
                module_path: module_path.into(),
                threads: threads.max(1),
                priority,
                func,
            }),
            prev_event_index: initial_event_index,
            curr_event_index: initial_event_index,
        }
    }

    pub fn id(&self) -> SystemId {
        self.id
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.kind, SystemKind::Worker(_))
    }

    pub fn priority(&self) -> Priority {
        match &self.kind {
            SystemKind::Worker(w) => w.priority,
            SystemKind::Main(_) => Priority::Normal,
        }
    }

    pub(crate) fn kind_mut(&mut self) -> &mut SystemKind<R> {
        &mut self.kind
    }

    pub(crate) fn prev_event_index(&self) -> u32 {
        self.prev_event_index
    }

    pub(crate) fn curr_event_index(&self) -> u32 {
        self.curr_event_index
    }

    /// Shift the reclamation window forward: `prev` becomes the old
    /// `curr`, `curr` becomes the event log's write index as of the start
    /// of this tick.
    pub(crate) fn advance_markers(&mut self, new_curr: u32) {
        self.prev_event_index = self.curr_event_index;
        self.curr_event_index = new_curr;
    }
}

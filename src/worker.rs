//! Lazy OS-thread pool that runs worker systems.
//!
//! One thread is spawned per `(module_path, thread_index)` the first time
//! it is needed and then kept alive across ticks. The first dispatch to a
//! given thread sends an `Init` message carrying the shared world state;
//! every later dispatch sends only an `Execute` message naming the
//! function to run. Dispatch is split into `dispatch` (send, don't wait)
//! and `join` (wait, with a timeout) so that `World::execute` can fan a
//! whole tick's worth of worker systems out before blocking on any of
//! them (ยง4.8, ยง5).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::system::WorkerSystem;
use crate::world::{Context, WorldShared};
use crate::query::ReaderId;
use crate::EcsError;

const INIT_TIMEOUT: Duration = Duration::from_secs(5);
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

enum WorkerMessage<R> {
    Init {
        shared: Arc<WorldShared<R>>,
        thread_index: usize,
    },
    Execute {
        func: fn(&mut Context<R>),
        tick: u64,
        reader_id: u32,
        thread_index: usize,
    },
    Shutdown,
}

enum WorkerReply {
    Ack,
    Err(String),
}

struct WorkerHandle<R> {
    to_worker: Sender<WorkerMessage<R>>,
    from_worker: Receiver<WorkerReply>,
    join: Option<JoinHandle<()>>,
    initialized: bool,
}

fn spawn_worker<R: Send + Sync + 'static>() -> WorkerHandle<R> {
    let (to_worker, rx) = bounded::<WorkerMessage<R>>(4);
    let (reply_tx, from_worker) = bounded::<WorkerReply>(4);

    let join = std::thread::spawn(move || {
        let mut shared: Option<Arc<WorldShared<R>>> = None;
        let mut thread_index = 0usize;
        while let Ok(message) = rx.recv() {
            match message {
                WorkerMessage::Init {
                    shared: init_shared,
                    thread_index: idx,
                } => {
                    shared = Some(init_shared);
                    thread_index = idx;
                    let _ = reply_tx.send(WorkerReply::Ack);
                }
                WorkerMessage::Execute {
                    func,
                    tick,
                    reader_id,
                    thread_index: idx,
                } => {
                    thread_index = idx;
                    let Some(shared) = shared.clone() else {
                        let _ = reply_tx.send(WorkerReply::Err(
                            "worker received Execute before Init".to_owned(),
                        ));
                        continue;
                    };
                    let mut context = Context::for_worker(shared, ReaderId(reader_id), thread_index, tick);
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func(&mut context)));
                    match outcome {
                        Ok(()) => {
                            let _ = reply_tx.send(WorkerReply::Ack);
                        }
                        Err(payload) => {
                            let message = payload
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| payload.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "worker system panicked".to_owned());
                            let _ = reply_tx.send(WorkerReply::Err(message));
                        }
                    }
                }
                WorkerMessage::Shutdown => break,
            }
        }
    });

    WorkerHandle {
        to_worker,
        from_worker,
        join: Some(join),
        initialized: false,
    }
}

/// A dispatched-but-not-yet-joined worker execution.
pub struct PendingWorker {
    module_path: String,
    thread_index: usize,
    from_worker: Receiver<WorkerReply>,
}

/// Owns the lazily created worker-thread pool, keyed by `(module_path,
/// thread_index)`.
pub struct WorkerManager<R: Send + Sync + 'static> {
    max_workers: usize,
    pools: HashMap<String, Vec<WorkerHandle<R>>>,
}

impl<R: Send + Sync + 'static> WorkerManager<R> {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            pools: HashMap::new(),
        }
    }

    fn total_spawned(&self) -> usize {
        self.pools.values().map(|v| v.len()).sum()
    }

    fn ensure_worker(&mut self, module_path: &str, thread_index: usize, shared: &Arc<WorldShared<R>>) -> Result<(), EcsError> {
        let slots = self.pools.entry(module_path.to_owned()).or_default();
        while slots.len() <= thread_index {
            if self.max_workers != usize::MAX && self.total_spawned() >= self.max_workers {
                break;
            }
            slots.push(spawn_worker());
        }
        let slots = self.pools.get_mut(module_path).expect("just inserted");
        let handle = slots.get_mut(thread_index).ok_or_else(|| EcsError::WorkerInitTimeout {
            module: module_path.to_owned(),
        })?;
        if handle.initialized {
            return Ok(());
        }
        if handle
            .to_worker
            .send(WorkerMessage::Init {
                shared: Arc::clone(shared),
                thread_index,
            })
            .is_err()
        {
            return Err(EcsError::WorkerInitTimeout {
                module: module_path.to_owned(),
            });
        }
        match handle.from_worker.recv_timeout(INIT_TIMEOUT) {
            Ok(WorkerReply::Ack) => {
                handle.initialized = true;
                Ok(())
            }
            Ok(WorkerReply::Err(message)) => Err(EcsError::WorkerError { message }),
            Err(_) => {
                self.terminate(module_path, thread_index);
                Err(EcsError::WorkerInitTimeout {
                    module: module_path.to_owned(),
                })
            }
        }
    }

    /// Remove a worker from the live pool without joining its thread: a
    /// timed-out worker may be stuck, and std has no way to preempt it.
    fn terminate(&mut self, module_path: &str, thread_index: usize) {
        if let Some(slots) = self.pools.get_mut(module_path) {
            if thread_index < slots.len() {
                let _ = slots[thread_index].to_worker.send(WorkerMessage::Shutdown);
                slots.remove(thread_index);
            }
        }
    }

    /// Send `Init` (if needed) and `Execute` to every thread this system
    /// wants, without waiting for completion. `reader_base` is the first
    /// of `system.threads` consecutive reader ids handed out, one per
    /// thread.
    pub fn dispatch(
        &mut self,
        system: &WorkerSystem<R>,
        shared: &Arc<WorldShared<R>>,
        tick: u64,
        reader_base: u32,
    ) -> Result<Vec<PendingWorker>, EcsError> {
        let mut pending = Vec::with_capacity(system.threads);
        for thread_index in 0..system.threads {
            self.ensure_worker(&system.module_path, thread_index, shared)?;
            let slots = self.pools.get(&system.module_path).expect("ensured above");
            let handle = &slots[thread_index];
            if handle
                .to_worker
                .send(WorkerMessage::Execute {
                    func: system.func,
                    tick,
                    reader_id: reader_base + thread_index as u32,
                    thread_index,
                })
                .is_err()
            {
                return Err(EcsError::WorkerExecuteTimeout {
                    module: system.module_path.clone(),
                });
            }
            pending.push(PendingWorker {
                module_path: system.module_path.clone(),
                thread_index,
                from_worker: handle.from_worker.clone(),
            });
        }
        Ok(pending)
    }

    /// Wait for every dispatched execution to acknowledge, with a 30s
    /// timeout per worker. The first failure (timeout or worker error) is
    /// returned; other pending workers are still drained so their threads
    /// are not left holding a stale reply.
    pub fn join(&mut self, pending: Vec<PendingWorker>) -> Result<(), EcsError> {
        let mut first_error = None;
        for p in pending {
            match p.from_worker.recv_timeout(EXECUTE_TIMEOUT) {
                Ok(WorkerReply::Ack) => {}
                Ok(WorkerReply::Err(message)) => {
                    first_error.get_or_insert(EcsError::WorkerError { message });
                }
                Err(_) => {
                    self.terminate(&p.module_path, p.thread_index);
                    first_error.get_or_insert(EcsError::WorkerExecuteTimeout {
                        module: p.module_path,
                    });
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Terminate every worker. Other workers stay usable until their own
    /// `dispose` call; this only tears down this manager's pool.
    pub fn dispose(&mut self) {
        for slots in self.pools.values_mut() {
            for handle in slots.drain(..) {
                let _ = handle.to_worker.send(WorkerMessage::Shutdown);
                if let Some(join) = handle.join {
                    let _ = join.join();
                }
            }
        }
        self.pools.clear();
    }
}

impl<R: Send + Sync + 'static> Drop for WorkerManager<R> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentDef;
    use crate::world::WorldOptions;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_shared() -> Arc<WorldShared<()>> {
        let defs: Vec<ComponentDef> = Vec::new();
        let world = crate::world::World::new(defs, WorldOptions::default()).unwrap();
        world.shared_handle()
    }

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn bump(_ctx: &mut Context<()>) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn panics(_ctx: &mut Context<()>) {
        panic!("boom");
    }

    #[test]
    fn dispatch_then_join_runs_function_on_every_thread() {
        CALLS.store(0, Ordering::SeqCst);
        let shared = test_shared();
        let mut manager: WorkerManager<()> = WorkerManager::new(4);
        let system = WorkerSystem {
            module_path: "bump_module".to_owned(),
            threads: 3,
            priority: crate::system::Priority::Normal,
            func: bump,
        };
        let pending = manager.dispatch(&system, &shared, 1, 0).unwrap();
        manager.join(pending).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn worker_panic_surfaces_as_worker_error() {
        let shared = test_shared();
        let mut manager: WorkerManager<()> = WorkerManager::new(2);
        let system = WorkerSystem {
            module_path: "panic_module".to_owned(),
            threads: 1,
            priority: crate::system::Priority::Normal,
            func: panics,
        };
        let pending = manager.dispatch(&system, &shared, 1, 0).unwrap();
        let result = manager.join(pending);
        assert!(matches!(result, Err(EcsError::WorkerError { .. })));
    }

    #[test]
    fn reused_worker_skips_reinit() {
        CALLS.store(0, Ordering::SeqCst);
        let shared = test_shared();
        let mut manager: WorkerManager<()> = WorkerManager::new(2);
        let system = WorkerSystem {
            module_path: "reuse_module".to_owned(),
            threads: 1,
            priority: crate::system::Priority::Normal,
            func: bump,
        };
        for tick in 1..=3u64 {
            let pending = manager.dispatch(&system, &shared, tick, 0).unwrap();
            manager.join(pending).unwrap();
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }
}

//! Worker team lifecycle and the per-query shared-state registry.
//!
//! Every worker builds its own copy of the operator tree. Nodes that must be
//! common to all copies (a join's hash table, a scan cursor) ask their
//! [`WorkerContext`] for shared state; since every worker builds the tree in
//! the same order, the n-th request of each worker resolves to the same
//! object.

use std::any::{Any, type_name};
use std::panic;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::barrier::{BarrierHandle, HierarchicBarrier};
use crate::config::ExecConfig;
use crate::error::{ExecError, Result};
use crate::mem::{Allocator, GlobalPool, ResetableAllocator};
use crate::ops::Operator;
use crate::vector::VectorAllocator;

type SharedState = Arc<dyn Any + Send + Sync>;

/// Shared state objects keyed by operator build order.
#[derive(Default)]
pub struct SharedStateManager {
    states: Mutex<Vec<Option<SharedState>>>,
    once_done: Mutex<usize>,
}

impl SharedStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the object at `index`, creating it with `T::default()` on the
    /// first request.
    pub fn get<T: Default + Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>> {
        let mut states = self.states.lock();
        if states.len() <= index {
            states.resize(index + 1, None);
        }
        let state = states[index].get_or_insert_with(|| Arc::new(T::default()));
        Arc::clone(state).downcast::<T>().map_err(|_| {
            ExecError::ContractViolation(format!(
                "shared state {index} is not a {}",
                type_name::<T>()
            ))
        })
    }

    /// Runs `f` for `index` exactly once across all callers. Indices must be
    /// requested in increasing order without gaps; a later caller for an
    /// index that already ran returns immediately.
    pub fn once(&self, index: usize, f: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut done = self.once_done.lock();
        if index < *done {
            return Ok(());
        }
        if index > *done {
            return Err(ExecError::ContractViolation(format!(
                "once({index}) called before once({})",
                *done
            )));
        }
        f()?;
        *done += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Poisons the barrier unless the worker finished successfully, so that a
/// failing or panicking worker never leaves its peers spinning.
struct PoisonGuard<'a> {
    barrier: &'a HierarchicBarrier,
    armed: bool,
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.barrier.poison();
        }
    }
}

/// A fixed team of threads sharing one barrier tree. The calling thread is
/// worker 0.
pub struct WorkerGroup {
    threads: usize,
    barrier: Arc<HierarchicBarrier>,
    pin: bool,
}

impl WorkerGroup {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            threads,
            barrier: Arc::new(HierarchicBarrier::new(threads)),
            pin: false,
        }
    }

    /// Pins worker `t`, the calling thread included, to logical CPU
    /// `t mod cpus` when it starts.
    #[must_use]
    pub fn with_pinning(mut self, pin: bool) -> Self {
        self.pin = pin;
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `f(thread, barrier)` on every worker and waits for all of them.
    ///
    /// If any worker fails, the others are released from the barrier with
    /// [`ExecError::Aborted`] and the first root-cause error is returned. A
    /// panicking worker is resumed on the calling thread.
    pub fn run<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(usize, BarrierHandle) -> Result<R> + Sync,
    {
        tracing::debug!(threads = self.threads, "worker group start");
        let results = thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.threads - 1);
            for t in 1..self.threads {
                let f = &f;
                let spawned = thread::Builder::new()
                    .name(format!("vexec-worker-{t}"))
                    .spawn_scoped(s, move || self.work(t, f));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        self.barrier.poison();
                        return Err(ExecError::Spawn(e));
                    }
                }
            }
            let mut results = Vec::with_capacity(self.threads);
            results.push(self.work(0, &f));
            for handle in handles {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            Ok(results)
        })?;
        tracing::debug!(threads = self.threads, "worker group end");

        let mut values = Vec::with_capacity(results.len());
        let mut failure: Option<ExecError> = None;
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(e) => {
                    let replace = match &failure {
                        None => true,
                        Some(ExecError::Aborted) => !matches!(e, ExecError::Aborted),
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }

    fn work<R, F>(&self, thread: usize, f: &F) -> Result<R>
    where
        F: Fn(usize, BarrierHandle) -> Result<R>,
    {
        if self.pin {
            pin_current(thread);
        }
        let mut guard = PoisonGuard {
            barrier: &self.barrier,
            armed: true,
        };
        let result = f(thread, BarrierHandle::new(Arc::clone(&self.barrier), thread));
        match &result {
            Ok(_) => guard.armed = false,
            Err(ExecError::Aborted) => {}
            Err(e) => tracing::debug!(thread, error = %e, "worker failed"),
        }
        result
    }
}

/// Best effort: a worker that cannot be pinned runs unpinned.
fn pin_current(thread: usize) {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    let Some(&core) = cores.get(thread % cores.len().max(1)) else {
        tracing::warn!(thread, "no cpu list available, worker not pinned");
        return;
    };
    if core_affinity::set_for_current(core) {
        tracing::trace!(thread, cpu = core.id, "worker pinned");
    } else {
        tracing::warn!(thread, cpu = core.id, "pinning worker failed");
    }
}

/// Everything a worker needs while building its operator tree.
pub struct WorkerContext {
    thread: usize,
    config: ExecConfig,
    pool: Arc<GlobalPool>,
    barrier: BarrierHandle,
    registry: Arc<SharedStateManager>,
    next_shared: usize,
    next_once: usize,
    vectors: VectorAllocator,
}

impl WorkerContext {
    pub fn new(
        thread: usize,
        config: ExecConfig,
        pool: Arc<GlobalPool>,
        barrier: BarrierHandle,
        registry: Arc<SharedStateManager>,
    ) -> Self {
        let vectors = VectorAllocator::new(config.vector_size);
        Self {
            thread,
            config,
            pool,
            barrier,
            registry,
            next_shared: 0,
            next_once: 0,
            vectors,
        }
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn threads(&self) -> usize {
        self.barrier.threads()
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn vector_size(&self) -> usize {
        self.config.vector_size
    }

    pub fn pool(&self) -> &Arc<GlobalPool> {
        &self.pool
    }

    pub fn allocator(&self) -> Allocator {
        Allocator::new(Arc::clone(&self.pool))
    }

    pub fn resetable_allocator(&self) -> ResetableAllocator {
        ResetableAllocator::new(Arc::clone(&self.pool))
    }

    pub fn barrier(&self) -> BarrierHandle {
        self.barrier.clone()
    }

    pub fn vectors(&mut self) -> &mut VectorAllocator {
        &mut self.vectors
    }

    /// The shared state of the next operator in build order.
    pub fn shared<T: Default + Send + Sync + 'static>(&mut self) -> Result<Arc<T>> {
        let index = self.next_shared;
        self.next_shared += 1;
        self.registry.get(index)
    }

    /// Runs `f` on exactly one worker; the others skip it.
    pub fn once(&mut self, f: impl FnOnce() -> Result<()>) -> Result<()> {
        let index = self.next_once;
        self.next_once += 1;
        self.registry.once(index, f)
    }
}

/// Runs one query: every worker builds its operator tree with `build` and
/// pulls from the root until it is exhausted. Returns the number of rows the
/// roots produced in total.
pub fn execute<F>(config: &ExecConfig, build: F) -> Result<usize>
where
    F: Fn(&mut WorkerContext) -> Result<Box<dyn Operator>> + Sync,
{
    config.validate()?;
    let pool = GlobalPool::new(config.pool_chunk_size)?;
    let registry = Arc::new(SharedStateManager::new());
    let group = WorkerGroup::new(config.threads).with_pinning(config.pin_workers);

    let rows = group.run(|thread, barrier| {
        let mut ctx = WorkerContext::new(
            thread,
            config.clone(),
            Arc::clone(&pool),
            barrier,
            Arc::clone(&registry),
        );
        let mut root = build(&mut ctx)?;
        let mut rows = 0;
        loop {
            let n = root.next()?;
            if n == 0 {
                break;
            }
            rows += n;
        }
        Ok(rows)
    })?;
    Ok(rows.into_iter().sum())
}

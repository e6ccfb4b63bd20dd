//! Reusable spinning barriers.
//!
//! A [`Barrier`] is a sense-reversing counter: arrivals decrement
//! `remaining`, the thread that takes it to zero re-arms the counter, runs the
//! finalizer and then publishes the next round. Everybody else spins on the
//! round number.
//!
//! [`HierarchicBarrier`] arranges barriers in a tree with a fan-in of eight so
//! that no counter is contended by more than eight threads. The finalizer of a
//! child node is "wait on my parent", so only the last arriver at the root runs
//! the real finalizer, and the release cascades back down the tree.
//!
//! ```text
//!                    root (3)
//!           ┌──────────┼──────────┐
//!        leaf 0     leaf 1     leaf 2
//!       t0 .. t7   t8 .. t15  t16 .. t19
//! ```

use std::hint::spin_loop;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crate::error::{ExecError, Result};

const FAN_IN: usize = 8;
const SPINS_BEFORE_YIELD: u32 = 128;

pub struct Barrier {
    threads: usize,
    remaining: AtomicUsize,
    round: AtomicUsize,
    poisoned: AtomicBool,
}

impl Barrier {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "a barrier needs at least one thread");
        Self {
            threads,
            remaining: AtomicUsize::new(threads),
            round: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn wait(&self) -> Result<()> {
        self.arrive(&self.poisoned, || Ok(()))
    }

    /// Waits for all threads; the last one to arrive runs `finalizer` before
    /// anybody is released.
    pub fn wait_with(&self, finalizer: impl FnOnce()) -> Result<()> {
        self.arrive(&self.poisoned, || {
            finalizer();
            Ok(())
        })
    }

    /// Releases every current and future waiter with [`ExecError::Aborted`].
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    fn arrive(&self, poisoned: &AtomicBool, finalizer: impl FnOnce() -> Result<()>) -> Result<()> {
        if poisoned.load(Ordering::Acquire) {
            return Err(ExecError::Aborted);
        }
        // Must be read before arriving, the last arriver bumps it.
        let round = self.round.load(Ordering::Acquire);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.remaining.store(self.threads, Ordering::Relaxed);
            let result = finalizer();
            self.round.store(round.wrapping_add(1), Ordering::Release);
            return result;
        }

        let mut spins = 0u32;
        while self.round.load(Ordering::Acquire) == round {
            if poisoned.load(Ordering::Acquire) {
                return Err(ExecError::Aborted);
            }
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                spin_loop();
            } else {
                thread::yield_now();
            }
        }
        Ok(())
    }
}

struct Node {
    barrier: Barrier,
    parent: Option<usize>,
}

/// Tree of [`Barrier`]s for large thread counts.
pub struct HierarchicBarrier {
    threads: usize,
    nodes: Vec<Node>,
    poisoned: AtomicBool,
}

impl HierarchicBarrier {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "a barrier needs at least one thread");

        // Level sizes bottom-up: each node waits for up to FAN_IN children.
        let mut levels: Vec<Vec<usize>> = Vec::new();
        let mut members = threads;
        loop {
            let groups = members.div_ceil(FAN_IN);
            let sizes = (0..groups)
                .map(|g| (members - g * FAN_IN).min(FAN_IN))
                .collect();
            levels.push(sizes);
            if groups == 1 {
                break;
            }
            members = groups;
        }

        let mut nodes = Vec::new();
        let mut level_start = Vec::with_capacity(levels.len());
        for sizes in &levels {
            level_start.push(nodes.len());
            for &size in sizes {
                nodes.push(Node {
                    barrier: Barrier::new(size),
                    parent: None,
                });
            }
        }
        for level in 0..levels.len() - 1 {
            for i in 0..levels[level].len() {
                nodes[level_start[level] + i].parent = Some(level_start[level + 1] + i / FAN_IN);
            }
        }

        Self {
            threads,
            nodes,
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn wait(&self, thread: usize) -> Result<()> {
        self.wait_with(thread, || {})
    }

    /// Like [`Barrier::wait_with`]: exactly one thread of the whole tree runs
    /// `finalizer`, after every thread has arrived.
    pub fn wait_with(&self, thread: usize, finalizer: impl FnOnce()) -> Result<()> {
        debug_assert!(thread < self.threads);
        let mut finalizer = Some(finalizer);
        self.wait_at(thread / FAN_IN, &mut finalizer)
    }

    fn wait_at<F: FnOnce()>(&self, node: usize, finalizer: &mut Option<F>) -> Result<()> {
        let current = &self.nodes[node];
        current.barrier.arrive(&self.poisoned, || match current.parent {
            Some(parent) => self.wait_at(parent, finalizer),
            None => {
                if let Some(f) = finalizer.take() {
                    f();
                }
                Ok(())
            }
        })
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}

/// A worker's view of the group barrier.
#[derive(Clone)]
pub struct BarrierHandle {
    barrier: Arc<HierarchicBarrier>,
    thread: usize,
}

impl BarrierHandle {
    pub fn new(barrier: Arc<HierarchicBarrier>, thread: usize) -> Self {
        Self { barrier, thread }
    }

    pub fn wait(&self) -> Result<()> {
        self.barrier.wait(self.thread)
    }

    pub fn wait_with(&self, finalizer: impl FnOnce()) -> Result<()> {
        self.barrier.wait_with(self.thread, finalizer)
    }

    pub fn threads(&self) -> usize {
        self.barrier.threads()
    }
}

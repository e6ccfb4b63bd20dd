//! Bump allocation for hash table entries and spill chunks.
//!
//! ```text
//!   GlobalPool (one per query, shared)          Allocator (one per operator, per thread)
//!  ┌────────────┐  ┌────────────────────┐       ┌─────────────────────────┐
//!  │ chunk 8MiB │─►│ chunk 16MiB        │ ◄─────│ cursor into a 1MiB grab │
//!  └────────────┘  └────────────────────┘       └─────────────────────────┘
//! ```
//!
//! Nothing handed out by the pool is freed before the pool itself is dropped.
//! Memory returned by an allocator therefore stays valid for as long as any
//! allocator (each holds an `Arc` to its pool) or the query context is alive.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::{ExecError, Result};

/// Alignment of every allocation handed out by this module.
pub const ALIGN: usize = 16;

/// Default size of the chunk an [`Allocator`] grabs from the pool.
pub const DEFAULT_GRAB: usize = 1 << 20;

#[inline(always)]
fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// An anonymous mapping bumped through a shared cursor.
struct PoolChunk {
    _map: MmapMut,
    base: NonNull<u8>,
    capacity: usize,
    offset: AtomicUsize,
}

// SAFETY: `base` points into `_map`, which is owned by the chunk. Disjoint
// ranges are handed out through the atomic `offset`.
unsafe impl Send for PoolChunk {}
unsafe impl Sync for PoolChunk {}

impl PoolChunk {
    fn map(capacity: usize) -> Result<Self> {
        let mut map = MmapMut::map_anon(capacity).map_err(|source| ExecError::Allocation {
            size: capacity,
            source,
        })?;

        #[cfg(target_os = "linux")]
        if let Err(e) = map.advise(memmap2::Advice::HugePage) {
            tracing::warn!(capacity, error = %e, "huge page advice rejected");
        }

        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| ExecError::Allocation {
            size: capacity,
            source: std::io::Error::other("null mapping"),
        })?;
        tracing::debug!(capacity, "global pool mapped chunk");

        Ok(Self {
            _map: map,
            base,
            capacity,
            offset: AtomicUsize::new(0),
        })
    }

    /// Optimistically advances the cursor. Returns `None` once the chunk is
    /// exhausted for this request.
    fn try_bump(&self, size: usize) -> Option<NonNull<u8>> {
        let mut current = self.offset.load(Ordering::Relaxed);
        loop {
            let aligned = align_up(current, ALIGN);
            let end = aligned.checked_add(size)?;
            if end > self.capacity {
                return None;
            }
            match self.offset.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                // SAFETY: `aligned + size <= capacity` and the range is ours.
                Ok(_) => return Some(unsafe { self.base.add(aligned) }),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Process-wide (per query) multi-producer bump pool.
///
/// The fast path is a CAS on the current chunk's cursor. When the chunk runs
/// dry, one thread maps a chunk at least twice as large (or large enough for
/// the request) under the mutex while the others retry.
pub struct GlobalPool {
    current: AtomicPtr<PoolChunk>,
    chunks: Mutex<Vec<Box<PoolChunk>>>,
}

impl GlobalPool {
    pub fn new(initial_size: usize) -> Result<Arc<Self>> {
        let mut first = Box::new(PoolChunk::map(initial_size.max(ALIGN))?);
        let current = AtomicPtr::new(&mut *first as *mut PoolChunk);
        Ok(Arc::new(Self {
            current,
            chunks: Mutex::new(vec![first]),
        }))
    }

    /// Returns `size` bytes aligned to [`ALIGN`]. The memory is not zeroed
    /// once it has been handed out and reset by a [`ResetableAllocator`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        loop {
            let chunk = self.current.load(Ordering::Acquire);
            // SAFETY: chunks are boxed and only dropped together with the pool.
            if let Some(ptr) = unsafe { (*chunk).try_bump(size) } {
                return Ok(ptr);
            }
            self.grow(chunk, size)?;
        }
    }

    fn grow(&self, observed: *mut PoolChunk, size: usize) -> Result<()> {
        let mut chunks = self.chunks.lock();
        if self.current.load(Ordering::Acquire) != observed {
            // Somebody else already mapped a fresh chunk.
            return Ok(());
        }
        let last = chunks.last().map_or(0, |c| c.capacity);
        let capacity = (last * 2).max(size + ALIGN);
        let mut chunk = Box::new(PoolChunk::map(capacity)?);
        self.current
            .store(&mut *chunk as *mut PoolChunk, Ordering::Release);
        chunks.push(chunk);
        Ok(())
    }

    /// Total bytes mapped so far.
    pub fn mapped(&self) -> usize {
        self.chunks.lock().iter().map(|c| c.capacity).sum()
    }
}

/// Thread-private bump allocator that grabs large chunks from a
/// [`GlobalPool`].
pub struct Allocator {
    pool: Arc<GlobalPool>,
    chunk: Option<NonNull<u8>>,
    used: usize,
    capacity: usize,
    grab: usize,
}

// SAFETY: the grabbed chunk belongs to the pool, which is `Send + Sync` and
// kept alive by `pool`.
unsafe impl Send for Allocator {}

impl Allocator {
    pub fn new(pool: Arc<GlobalPool>) -> Self {
        Self::with_grab(pool, DEFAULT_GRAB)
    }

    pub fn with_grab(pool: Arc<GlobalPool>, grab: usize) -> Self {
        Self {
            pool,
            chunk: None,
            used: 0,
            capacity: 0,
            grab: grab.max(ALIGN),
        }
    }

    pub fn pool(&self) -> &Arc<GlobalPool> {
        &self.pool
    }

    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let aligned = align_up(self.used, ALIGN);
        if let Some(base) = self.chunk {
            if aligned + size <= self.capacity {
                self.used = aligned + size;
                // SAFETY: in bounds of the grabbed chunk.
                return Ok(unsafe { base.add(aligned) });
            }
        }
        let capacity = self.grab.max(size);
        let base = self.pool.allocate(capacity)?;
        self.chunk = Some(base);
        self.capacity = capacity;
        self.used = size;
        Ok(base)
    }
}

/// Like [`Allocator`], but remembers its chunks so that [`reset`] rewinds to
/// the first one in O(1) and later allocations reuse the same memory.
///
/// [`reset`]: ResetableAllocator::reset
pub struct ResetableAllocator {
    pool: Arc<GlobalPool>,
    chunks: Vec<(NonNull<u8>, usize)>,
    current: usize,
    used: usize,
    grab: usize,
}

// SAFETY: see `Allocator`.
unsafe impl Send for ResetableAllocator {}

impl ResetableAllocator {
    pub fn new(pool: Arc<GlobalPool>) -> Self {
        Self::with_grab(pool, DEFAULT_GRAB)
    }

    pub fn with_grab(pool: Arc<GlobalPool>, grab: usize) -> Self {
        Self {
            pool,
            chunks: Vec::new(),
            current: 0,
            used: 0,
            grab: grab.max(ALIGN),
        }
    }

    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        while let Some(&(base, capacity)) = self.chunks.get(self.current) {
            let aligned = align_up(self.used, ALIGN);
            if aligned + size <= capacity {
                self.used = aligned + size;
                // SAFETY: in bounds of a chunk owned by the pool.
                return Ok(unsafe { base.add(aligned) });
            }
            self.current += 1;
            self.used = 0;
        }
        let capacity = self.grab.max(size);
        let base = self.pool.allocate(capacity)?;
        self.chunks.push((base, capacity));
        self.current = self.chunks.len() - 1;
        self.used = size;
        Ok(base)
    }

    /// Makes every chunk available again. Pointers handed out before the
    /// reset must no longer be used.
    pub fn reset(&mut self) {
        self.current = 0;
        self.used = 0;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

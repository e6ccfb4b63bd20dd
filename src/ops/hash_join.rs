//! Equi-join over a shared, tagged hash table.
//!
//! # Build
//!
//! Every worker drains its build input, materializing one entry per row
//! (header, keys, payload) contiguously per batch in a [`Stack`]. A barrier
//! whose finalizer sizes the shared table from the global row count follows;
//! then each worker inserts its own entries with CAS and a second barrier
//! publishes the finished table to all probers.
//!
//! # Probe
//!
//! The probe is a resumable state machine. A probe batch is hashed once;
//! matching then emits at most one vector of `(entry, probe row)` pairs per
//! call and records in a [`Continuation`] where to resume. The strategies
//! differ only in traversal order:
//!
//! - scalar walks each chain to the end before moving on, and can stop and
//!   resume in the middle of a chain.
//! - parallel looks up chain heads for many probes and parks the rest of each
//!   chain in a followup ring, draining the ring before looking up more heads.
//! - simd is parallel with eight head lookups per step.
//! - boncz queues every chain head unchecked and checks hashes only while
//!   draining.
//!
//! Candidates then pass a key-equality filter that removes hash collisions,
//! and the surviving entries' payloads are gathered.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::barrier::BarrierHandle;
use crate::config::JoinStrategy;
use crate::error::{ExecError, Result};
use crate::hashmap::{Entry, EntryPtr, Hashmap, LANES};
use crate::mem::ALIGN;
use crate::stack::Stack;
use crate::vector::{ColumnType, Input, Pos, Vector, layout_of};
use crate::worker::WorkerContext;

use super::primitives::{
    gather_entry, hash, hash_sel, keys_equal, rehash, rehash_sel, scatter, scatter_sel,
};
use super::{Expression, Operator};

/// State common to every worker's copy of one join.
#[derive(Default)]
pub struct JoinShared {
    rows: AtomicUsize,
    table: OnceLock<Hashmap>,
}

/// A join child together with the selection vector it produces, if any.
pub struct JoinInput {
    op: Box<dyn Operator>,
    sel: Option<Vector<Pos>>,
}

impl JoinInput {
    pub fn new(op: Box<dyn Operator>) -> Self {
        Self { op, sel: None }
    }

    /// `op` produces a selection: only rows `sel[..n]` of its buffers are
    /// live.
    pub fn with_selection(op: Box<dyn Operator>, sel: Vector<Pos>) -> Self {
        Self { op, sel: Some(sel) }
    }
}

/// Bounded ring of `(probe row, next entry)` pairs still to be walked.
struct Followup {
    ids: Vec<Pos>,
    entries: Vec<EntryPtr>,
    read: usize,
    write: usize,
    mask: usize,
}

impl Followup {
    fn with_capacity(n: usize) -> Self {
        let capacity = n.max(2 * LANES).next_power_of_two();
        Self {
            ids: vec![0; capacity],
            entries: vec![ptr::null_mut(); capacity],
            read: 0,
            write: 0,
            mask: capacity - 1,
        }
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.read == self.write
    }

    #[inline(always)]
    fn free(&self) -> usize {
        self.ids.len() - self.len()
    }

    #[inline(always)]
    fn push(&mut self, id: Pos, entry: EntryPtr) {
        debug_assert!(self.free() > 0);
        let slot = self.write & self.mask;
        self.ids[slot] = id;
        self.entries[slot] = entry;
        self.write += 1;
    }

    #[inline(always)]
    fn pop(&mut self) -> Option<(Pos, EntryPtr)> {
        if self.is_empty() {
            return None;
        }
        let slot = self.read & self.mask;
        self.read += 1;
        Some((self.ids[slot], self.entries[slot]))
    }

    fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

/// Where matching resumes on the next call.
pub(crate) struct Continuation {
    num_probes: usize,
    next_probe: usize,
    /// Scalar only: entry to resume from for probe `next_probe`.
    last_entry: EntryPtr,
    followup: Followup,
}

impl Continuation {
    pub(crate) fn new(vector_size: usize) -> Self {
        Self {
            num_probes: 0,
            next_probe: 0,
            last_entry: ptr::null_mut(),
            followup: Followup::with_capacity(vector_size),
        }
    }

    /// Starts matching a new probe batch of `n` rows.
    pub(crate) fn start(&mut self, n: usize) {
        self.num_probes = n;
        self.next_probe = 0;
        self.last_entry = ptr::null_mut();
        self.followup.clear();
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.next_probe >= self.num_probes && self.last_entry.is_null() && self.followup.is_empty()
    }
}

/// Chain-order matching. Fills `build_matches`/`probe_matches` up to their
/// length and returns the number of pairs.
pub(crate) fn join_scalar(
    table: &Hashmap,
    hashes: &[u64],
    cont: &mut Continuation,
    build_matches: &mut [EntryPtr],
    probe_matches: &mut [Pos],
) -> usize {
    let batch = build_matches.len();
    let mut found = 0;
    let mut i = cont.next_probe;
    let mut entry = cont.last_entry;
    while i < cont.num_probes {
        let hash = hashes[i];
        if entry.is_null() {
            entry = table.find_chain_tagged(hash);
        }
        // SAFETY: the table is published and its entries live in the pool.
        unsafe {
            entry = Entry::next_with_hash(entry, hash);
            while !entry.is_null() {
                if found == batch {
                    cont.next_probe = i;
                    cont.last_entry = entry;
                    return found;
                }
                build_matches[found] = entry;
                probe_matches[found] = i as Pos;
                found += 1;
                entry = Entry::next_with_hash((*entry).next, hash);
            }
        }
        i += 1;
    }
    cont.next_probe = i;
    cont.last_entry = ptr::null_mut();
    found
}

/// Emits `entry` if its hash matches and parks the rest of its chain.
#[inline(always)]
fn visit(
    entry: EntryPtr,
    id: Pos,
    hash: u64,
    followup: &mut Followup,
    build_matches: &mut [EntryPtr],
    probe_matches: &mut [Pos],
    found: &mut usize,
) {
    // SAFETY: `entry` is a non-null entry of a published chain.
    let (entry_hash, next) = unsafe { ((*entry).hash, (*entry).next) };
    if entry_hash == hash {
        build_matches[*found] = entry;
        probe_matches[*found] = id;
        *found += 1;
    }
    if !next.is_null() {
        followup.push(id, next);
    }
}

/// Walks parked chains until the ring is empty or the output is full.
#[inline(always)]
fn drain(
    hashes: &[u64],
    followup: &mut Followup,
    build_matches: &mut [EntryPtr],
    probe_matches: &mut [Pos],
    found: &mut usize,
) {
    while *found < build_matches.len() {
        let Some((id, entry)) = followup.pop() else {
            return;
        };
        let hash = hashes[id as usize];
        visit(entry, id, hash, followup, build_matches, probe_matches, found);
    }
}

/// Followup-ring matching; `lanes` enables eight-wide head lookups.
pub(crate) fn join_parallel(
    table: &Hashmap,
    hashes: &[u64],
    cont: &mut Continuation,
    build_matches: &mut [EntryPtr],
    probe_matches: &mut [Pos],
    lanes: bool,
) -> usize {
    let batch = build_matches.len();
    let n = cont.num_probes;
    let mut found = 0;
    loop {
        drain(hashes, &mut cont.followup, build_matches, probe_matches, &mut found);
        if found == batch || cont.next_probe >= n {
            return found;
        }

        if lanes {
            while cont.next_probe + LANES <= n
                && cont.followup.free() >= LANES
                && found + LANES <= batch
            {
                let i = cont.next_probe;
                let mut lane_hashes = [0u64; LANES];
                lane_hashes.copy_from_slice(&hashes[i..i + LANES]);
                // SAFETY: the build finished inserting before the barrier.
                let (heads, mask) = unsafe { table.find_chain_tagged_batch(&lane_hashes) };
                if mask != 0 {
                    for l in 0..LANES {
                        if mask & (1 << l) != 0 {
                            visit(
                                heads[l],
                                (i + l) as Pos,
                                lane_hashes[l],
                                &mut cont.followup,
                                build_matches,
                                probe_matches,
                                &mut found,
                            );
                        }
                    }
                }
                cont.next_probe += LANES;
            }
        }

        while cont.next_probe < n && cont.followup.free() > 0 && found < batch {
            let i = cont.next_probe;
            let hash = hashes[i];
            let head = table.find_chain_tagged(hash);
            if !head.is_null() {
                visit(
                    head,
                    i as Pos,
                    hash,
                    &mut cont.followup,
                    build_matches,
                    probe_matches,
                    &mut found,
                );
            }
            cont.next_probe += 1;
        }
    }
}

/// Queues every chain head unchecked; hashes are compared while draining.
pub(crate) fn join_boncz(
    table: &Hashmap,
    hashes: &[u64],
    cont: &mut Continuation,
    build_matches: &mut [EntryPtr],
    probe_matches: &mut [Pos],
) -> usize {
    let batch = build_matches.len();
    let n = cont.num_probes;
    let mut found = 0;
    loop {
        drain(hashes, &mut cont.followup, build_matches, probe_matches, &mut found);
        if found == batch || cont.next_probe >= n {
            return found;
        }
        while cont.next_probe < n && cont.followup.free() > 0 {
            let i = cont.next_probe;
            let head = table.find_chain_tagged(hashes[i]);
            if !head.is_null() {
                cont.followup.push(i as Pos, head);
            }
            cont.next_probe += 1;
        }
    }
}

/// Declares the keys and payload of a [`Hashjoin`] and derives its entry
/// layout.
pub struct HashjoinBuilder<'a> {
    ctx: &'a mut WorkerContext,
    build: JoinInput,
    probe: JoinInput,
    shared: Arc<JoinShared>,
    layout_end: usize,
    keys: usize,
    build_hash: Expression,
    build_scatter: Expression,
    probe_hash: Expression,
    key_equal: Expression,
    gather: Expression,
    build_hashes: Vector<u64>,
    build_entries: Vector<EntryPtr>,
    probe_hashes: Vector<u64>,
    build_matches: Vector<EntryPtr>,
    probe_matches: Vector<Pos>,
}

impl<'a> HashjoinBuilder<'a> {
    pub fn new(ctx: &'a mut WorkerContext, build: JoinInput, probe: JoinInput) -> Result<Self> {
        let shared = ctx.shared::<JoinShared>()?;
        let vectors = ctx.vectors();
        let build_hashes = vectors.get();
        let build_entries = vectors.entries();
        let probe_hashes = vectors.get();
        let build_matches = vectors.entries();
        let probe_matches = vectors.get();
        Ok(Self {
            ctx,
            build,
            probe,
            shared,
            layout_end: Entry::HEADER,
            keys: 0,
            build_hash: Expression::new(),
            build_scatter: Expression::new(),
            probe_hash: Expression::new(),
            key_equal: Expression::new(),
            gather: Expression::new(),
            build_hashes,
            build_entries,
            probe_hashes,
            build_matches,
            probe_matches,
        })
    }

    fn place<T>(&mut self) -> Result<usize> {
        let (size, align) = layout_of::<T>();
        if align > ALIGN {
            return Err(ExecError::Layout(format!(
                "join column alignment {align} exceeds {ALIGN}"
            )));
        }
        let offset = self.layout_end.next_multiple_of(align);
        self.layout_end = offset + size;
        Ok(offset)
    }

    /// Adds an equality condition `build = probe`.
    pub fn key<T: ColumnType>(
        &mut self,
        build: impl Input<T> + Clone + 'static,
        probe: impl Input<T> + Clone + 'static,
    ) -> Result<()> {
        let offset = self.place::<T>()?;
        let first = self.keys == 0;
        self.keys += 1;

        let build_hash = match (&self.build.sel, first) {
            (None, true) => hash(build.clone(), self.build_hashes.clone()),
            (None, false) => rehash(build.clone(), self.build_hashes.clone()),
            (Some(sel), true) => hash_sel(sel.clone(), build.clone(), self.build_hashes.clone()),
            (Some(sel), false) => rehash_sel(sel.clone(), build.clone(), self.build_hashes.clone()),
        };
        self.build_hash.add(build_hash);
        self.add_scatter(build, offset);

        let probe_hash = match (&self.probe.sel, first) {
            (None, true) => hash(probe.clone(), self.probe_hashes.clone()),
            (None, false) => rehash(probe.clone(), self.probe_hashes.clone()),
            (Some(sel), true) => hash_sel(sel.clone(), probe.clone(), self.probe_hashes.clone()),
            (Some(sel), false) => rehash_sel(sel.clone(), probe.clone(), self.probe_hashes.clone()),
        };
        self.probe_hash.add(probe_hash);
        // Probe matches are positions into the probe buffers, no selection
        // needed.
        self.key_equal.add(keys_equal(
            self.build_matches.clone(),
            self.probe_matches.clone(),
            probe,
            offset,
        ));
        Ok(())
    }

    fn add_scatter<T: ColumnType>(&mut self, build: impl Input<T> + 'static, offset: usize) {
        let op = match &self.build.sel {
            None => scatter(build, self.build_entries.clone(), offset),
            Some(sel) => scatter_sel(sel.clone(), build, self.build_entries.clone(), offset),
        };
        self.build_scatter.add(op);
    }

    /// Carries a build column to the output. Returns the vector holding the
    /// value for each emitted match.
    pub fn payload<T: ColumnType>(&mut self, build: impl Input<T> + 'static) -> Result<Vector<T>> {
        let offset = self.place::<T>()?;
        self.add_scatter(build, offset);
        let out = self.ctx.vectors().get();
        self.gather
            .add(gather_entry(self.build_matches.clone(), offset, out.clone()));
        Ok(out)
    }

    /// Positions, in the probe input's buffers, of the rows of each emitted
    /// match.
    pub fn probe_matches(&self) -> Vector<Pos> {
        self.probe_matches.clone()
    }

    pub fn finish(self) -> Result<Hashjoin> {
        if self.keys == 0 {
            return Err(ExecError::ContractViolation(
                "hash join declared without a key".into(),
            ));
        }
        let entry_size = self.layout_end.next_multiple_of(8);
        let vector_size = self.ctx.vector_size();
        Ok(Hashjoin {
            build: self.build,
            probe: self.probe,
            shared: self.shared,
            barrier: self.ctx.barrier(),
            stack: Stack::new(self.ctx.allocator(), entry_size),
            entry_size,
            build_hash: self.build_hash,
            build_scatter: self.build_scatter,
            probe_hash: self.probe_hash,
            key_equal: self.key_equal,
            gather: self.gather,
            build_hashes: self.build_hashes,
            build_entries: self.build_entries,
            probe_hashes: self.probe_hashes,
            build_matches: self.build_matches,
            probe_matches: self.probe_matches,
            strategy: self.ctx.config().join_strategy,
            vector_size,
            cont: Continuation::new(vector_size),
            built: false,
        })
    }
}

pub struct Hashjoin {
    build: JoinInput,
    probe: JoinInput,
    shared: Arc<JoinShared>,
    barrier: BarrierHandle,
    stack: Stack,
    entry_size: usize,
    build_hash: Expression,
    build_scatter: Expression,
    probe_hash: Expression,
    key_equal: Expression,
    gather: Expression,
    build_hashes: Vector<u64>,
    build_entries: Vector<EntryPtr>,
    probe_hashes: Vector<u64>,
    build_matches: Vector<EntryPtr>,
    probe_matches: Vector<Pos>,
    strategy: JoinStrategy,
    vector_size: usize,
    cont: Continuation,
    built: bool,
}

impl Hashjoin {
    fn build(&mut self) -> Result<()> {
        let mut rows = 0;
        loop {
            let n = self.build.op.next()?;
            if n == 0 {
                break;
            }
            self.build_hash.evaluate(n);
            let base = self.stack.push_batch(n)?;
            {
                let hashes = self.build_hashes.borrow();
                let mut entries = self.build_entries.borrow_mut();
                for k in 0..n {
                    // SAFETY: `push_batch` reserved `n` zeroed records.
                    let entry = unsafe { base.add(k * self.entry_size) }.cast::<Entry>();
                    unsafe { (*entry.as_ptr()).hash = hashes[k] };
                    entries[k] = entry.as_ptr();
                }
            }
            self.build_scatter.evaluate(n);
            rows += n;
        }

        let shared = &self.shared;
        shared.rows.fetch_add(rows, Ordering::Relaxed);
        self.barrier.wait_with(|| {
            let total = shared.rows.load(Ordering::Relaxed);
            let table = shared.table.get_or_init(|| Hashmap::with_capacity(total));
            tracing::debug!(rows = total, capacity = table.capacity(), "join table sized");
        })?;

        let table = shared.table.get().ok_or_else(|| {
            ExecError::ContractViolation("join table missing after build barrier".into())
        })?;
        for record in self.stack.records() {
            let entry = record.cast::<Entry>().as_ptr();
            // SAFETY: the record is a fully written entry owned by the pool.
            unsafe { table.insert_tagged(entry, (*entry).hash) };
        }
        self.barrier.wait()?;
        tracing::trace!(rows, "join build inserted");
        Ok(())
    }
}

impl Operator for Hashjoin {
    fn next(&mut self) -> Result<usize> {
        if !self.built {
            self.build()?;
            self.built = true;
        }
        let shared = Arc::clone(&self.shared);
        let table = shared.table.get().ok_or_else(|| {
            ExecError::ContractViolation("probe started before the join table was built".into())
        })?;

        loop {
            if self.cont.exhausted() {
                let n = self.probe.op.next()?;
                if n == 0 {
                    return Ok(0);
                }
                self.probe_hash.evaluate(n);
                self.cont.start(n);
            }

            let found = {
                let hashes = self.probe_hashes.borrow();
                let mut build_matches = self.build_matches.borrow_mut();
                let mut probe_matches = self.probe_matches.borrow_mut();
                let bm = &mut build_matches[..self.vector_size];
                let pm = &mut probe_matches[..self.vector_size];
                match self.strategy {
                    JoinStrategy::Scalar => join_scalar(table, &hashes, &mut self.cont, bm, pm),
                    JoinStrategy::Parallel => {
                        join_parallel(table, &hashes, &mut self.cont, bm, pm, false)
                    }
                    JoinStrategy::Simd => join_parallel(table, &hashes, &mut self.cont, bm, pm, true),
                    JoinStrategy::Boncz => join_boncz(table, &hashes, &mut self.cont, bm, pm),
                }
            };
            if found == 0 {
                continue;
            }

            if let Some(sel) = &self.probe.sel {
                let sel = sel.borrow();
                let mut probe_matches = self.probe_matches.borrow_mut();
                for p in &mut probe_matches[..found] {
                    *p = sel[*p as usize];
                }
            }

            let matched = self.key_equal.evaluate(found);
            if matched == 0 {
                continue;
            }
            self.gather.evaluate(matched);
            return Ok(matched);
        }
    }
}

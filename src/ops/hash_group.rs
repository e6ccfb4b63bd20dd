//! Two-phase parallel grouping.
//!
//! In the local phase every worker pre-aggregates its input into a private
//! table of at most `group_capacity` groups. A full table is flushed: its
//! entries are copied into the worker's [`PartitionedDeque`], partitioned by
//! the top bits of the group hash, and the table starts over. After a barrier
//! every worker claims whole partitions, merges the spilled entries of all
//! workers for that partition into one table and emits the groups.
//!
//! Both phases compare keys with the `==` of their column type.

use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::barrier::BarrierHandle;
use crate::deque::PartitionedDeque;
use crate::error::{ExecError, Result};
use crate::hashmap::{Entry, EntryPtr, Hashmap, IdentityHasher};
use crate::mem::{ALIGN, Allocator, ResetableAllocator};
use crate::small_map::HashmapSmall;
use crate::vector::{ColumnType, Input, Numeric, Pos, Vector, layout_of};
use crate::worker::WorkerContext;

use super::primitives::{
    Combine, EntriesEqual, Fold, agg_entry, agg_entry_count, combine_entry, entries_equal,
    fold_max, fold_min, fold_sum, gather_entry, gather_sel, hash, init_entry, keys_equal, rehash,
    scatter_sel,
};
use super::{Aggregates, Expression, Operator};

/// Spills of every worker and the partition cursor of the merge phase.
#[derive(Default)]
pub struct GroupShared {
    spills: Mutex<Vec<Arc<PartitionedDeque>>>,
    next_partition: AtomicUsize,
}

type RowsEqual = Box<dyn Fn(Pos, Pos) -> bool>;

/// Declares the keys and aggregates of a [`HashGroup`].
pub struct HashGroupBuilder<'a> {
    ctx: &'a mut WorkerContext,
    child: Box<dyn Operator>,
    shared: Arc<GroupShared>,
    layout_end: usize,
    keys: usize,
    aggregates: usize,
    selection: Option<Vector<Pos>>,
    compact: Expression,
    hash: Expression,
    key_equal: Expression,
    rows_equal: Vec<RowsEqual>,
    entries_equal: Vec<EntriesEqual>,
    scatter_keys: Expression,
    init: Expression,
    update: Aggregates,
    combine: Vec<Combine>,
    gather: Expression,
    hashes: Vector<u64>,
    groups: Vector<EntryPtr>,
    cand_entries: Vector<EntryPtr>,
    cand_rows: Vector<Pos>,
    new_rows: Vector<Pos>,
    new_entries: Vector<EntryPtr>,
    out_entries: Vector<EntryPtr>,
}

impl<'a> HashGroupBuilder<'a> {
    pub fn new(ctx: &'a mut WorkerContext, child: Box<dyn Operator>) -> Result<Self> {
        let shared = ctx.shared::<GroupShared>()?;
        let vectors = ctx.vectors();
        let hashes = vectors.get();
        let groups = vectors.entries();
        let cand_entries = vectors.entries();
        let cand_rows = vectors.get();
        let new_rows = vectors.get();
        let new_entries = vectors.entries();
        let out_entries = vectors.entries();
        Ok(Self {
            ctx,
            child,
            shared,
            layout_end: Entry::HEADER,
            keys: 0,
            aggregates: 0,
            selection: None,
            compact: Expression::new(),
            hash: Expression::new(),
            key_equal: Expression::new(),
            rows_equal: Vec::new(),
            entries_equal: Vec::new(),
            scatter_keys: Expression::new(),
            init: Expression::new(),
            update: Aggregates::new(),
            combine: Vec::new(),
            gather: Expression::new(),
            hashes,
            groups,
            cand_entries,
            cand_rows,
            new_rows,
            new_entries,
            out_entries,
        })
    }

    fn place<T>(&mut self) -> Result<usize> {
        let (size, align) = layout_of::<T>();
        if align > ALIGN {
            return Err(ExecError::Layout(format!(
                "group column alignment {align} exceeds {ALIGN}"
            )));
        }
        let offset = self.layout_end.next_multiple_of(align);
        self.layout_end = offset + size;
        Ok(offset)
    }

    fn output<T: ColumnType>(&mut self, offset: usize) -> Vector<T> {
        let out = self.ctx.vectors().get();
        self.gather
            .add(gather_entry(self.out_entries.clone(), offset, out.clone()));
        out
    }

    /// Reads every key and aggregate input through `sel`, the output of a
    /// [`Select`](super::Select) below this operator. Must precede every
    /// key and aggregate.
    pub fn selection(&mut self, sel: Vector<Pos>) -> Result<()> {
        if self.keys > 0 || self.aggregates > 0 {
            return Err(ExecError::ContractViolation(
                "group selection set after its inputs were declared".into(),
            ));
        }
        self.selection = Some(sel);
        Ok(())
    }

    /// Copies the selected rows of `input` to the front of a scratch vector
    /// before each batch is grouped.
    fn compacted<T: ColumnType>(&mut self, sel: Vector<Pos>, input: impl Input<T> + 'static) -> Vector<T> {
        let out = self.ctx.vectors().get();
        self.compact.add(gather_sel(sel, input, out.clone()));
        out
    }

    /// Groups by `input`. Returns the vector holding each emitted group's
    /// key.
    pub fn key<T: ColumnType>(&mut self, input: impl Input<T> + Clone + 'static) -> Result<Vector<T>> {
        match self.selection.clone() {
            Some(sel) => {
                let input = self.compacted(sel, input);
                self.add_key(input)
            }
            None => self.add_key(input),
        }
    }

    fn add_key<T: ColumnType>(&mut self, input: impl Input<T> + Clone + 'static) -> Result<Vector<T>> {
        let offset = self.place::<T>()?;
        let op = if self.keys == 0 {
            hash(input.clone(), self.hashes.clone())
        } else {
            rehash(input.clone(), self.hashes.clone())
        };
        self.hash.add(op);
        self.keys += 1;

        self.key_equal.add(keys_equal(
            self.cand_entries.clone(),
            self.cand_rows.clone(),
            input.clone(),
            offset,
        ));
        let rows = input.clone();
        self.rows_equal.push(Box::new(move |a, b| {
            rows.with(|values| values[a as usize] == values[b as usize])
        }));
        self.entries_equal.push(entries_equal::<T>(offset));
        self.scatter_keys.add(scatter_sel(
            self.new_rows.clone(),
            input,
            self.new_entries.clone(),
            offset,
        ));
        Ok(self.output(offset))
    }

    fn fold<T: Numeric>(
        &mut self,
        input: impl Input<T> + 'static,
        init: T,
        fold: Fold<T>,
    ) -> Result<Vector<T>> {
        let offset = self.place::<T>()?;
        self.aggregates += 1;
        self.init
            .add(init_entry(self.new_entries.clone(), offset, init));
        match self.selection.clone() {
            Some(sel) => {
                let input = self.compacted(sel, input);
                self.update
                    .add(agg_entry(self.groups.clone(), input, offset, fold));
            }
            None => {
                self.update
                    .add(agg_entry(self.groups.clone(), input, offset, fold));
            }
        }
        self.combine.push(combine_entry(offset, fold));
        Ok(self.output(offset))
    }

    pub fn sum<T: Numeric>(&mut self, input: impl Input<T> + 'static) -> Result<Vector<T>> {
        self.fold(input, T::ZERO, fold_sum)
    }

    pub fn min<T: Numeric>(&mut self, input: impl Input<T> + 'static) -> Result<Vector<T>> {
        self.fold(input, T::MAX, fold_min)
    }

    pub fn max<T: Numeric>(&mut self, input: impl Input<T> + 'static) -> Result<Vector<T>> {
        self.fold(input, T::MIN, fold_max)
    }

    pub fn count(&mut self) -> Result<Vector<i64>> {
        let offset = self.place::<i64>()?;
        self.aggregates += 1;
        self.init
            .add(init_entry(self.new_entries.clone(), offset, 0_i64));
        self.update
            .add(agg_entry_count(self.groups.clone(), offset));
        self.combine.push(combine_entry::<i64>(offset, fold_sum));
        Ok(self.output(offset))
    }

    pub fn finish(self) -> Result<HashGroup> {
        if self.keys == 0 {
            return Err(ExecError::ContractViolation(
                "hash group declared without a key".into(),
            ));
        }
        let entry_size = self.layout_end.next_multiple_of(8);
        let config = self.ctx.config();
        let vector_size = config.vector_size;
        let group_capacity = config.group_capacity;
        let partitions = config.partitions();
        Ok(HashGroup {
            child: self.child,
            shared: self.shared,
            barrier: self.ctx.barrier(),
            entry_size,
            vector_size,
            group_capacity,
            compact: self.compact,
            hash: self.hash,
            key_equal: self.key_equal,
            rows_equal: self.rows_equal,
            entries_equal: self.entries_equal,
            scatter_keys: self.scatter_keys,
            init: self.init,
            update: self.update,
            combine: self.combine,
            gather: self.gather,
            hashes: self.hashes,
            groups: self.groups,
            cand_entries: self.cand_entries,
            cand_rows: self.cand_rows,
            new_rows: self.new_rows,
            new_entries: self.new_entries,
            out_entries: self.out_entries,
            retry: Vec::with_capacity(vector_size),
            missing: Vec::with_capacity(vector_size),
            assign: Vec::with_capacity(vector_size),
            pending: HashmapSmall::with_capacity(vector_size),
            table: Hashmap::with_capacity(group_capacity + vector_size),
            alloc: self.ctx.resetable_allocator(),
            local: Vec::new(),
            spill: Some(PartitionedDeque::new(partitions, entry_size)),
            spill_alloc: self.ctx.allocator(),
            spills: Vec::new(),
            partitions,
            result: Vec::new(),
            emitted: 0,
            aggregated: false,
        })
    }
}

pub struct HashGroup {
    child: Box<dyn Operator>,
    shared: Arc<GroupShared>,
    barrier: BarrierHandle,
    entry_size: usize,
    vector_size: usize,
    group_capacity: usize,

    compact: Expression,
    hash: Expression,
    key_equal: Expression,
    rows_equal: Vec<RowsEqual>,
    entries_equal: Vec<EntriesEqual>,
    scatter_keys: Expression,
    init: Expression,
    update: Aggregates,
    combine: Vec<Combine>,
    gather: Expression,

    hashes: Vector<u64>,
    groups: Vector<EntryPtr>,
    cand_entries: Vector<EntryPtr>,
    cand_rows: Vector<Pos>,
    new_rows: Vector<Pos>,
    new_entries: Vector<EntryPtr>,
    out_entries: Vector<EntryPtr>,
    retry: Vec<(EntryPtr, Pos)>,
    missing: Vec<Pos>,
    /// `(row, index into new_rows)` for every missing row.
    assign: Vec<(Pos, u32)>,
    /// Hash to index into `new_rows`, for groups created in this batch.
    pending: HashmapSmall<u64, u32, IdentityHasher>,

    table: Hashmap,
    alloc: ResetableAllocator,
    local: Vec<EntryPtr>,
    spill: Option<PartitionedDeque>,
    spill_alloc: Allocator,

    spills: Vec<Arc<PartitionedDeque>>,
    partitions: usize,
    result: Vec<EntryPtr>,
    emitted: usize,
    aggregated: bool,
}

impl HashGroup {
    /// Resolves `groups[i]` for rows whose group already exists locally and
    /// collects the others in `missing`.
    fn find_groups(&mut self, n: usize) {
        self.missing.clear();
        let mut candidates = 0;
        {
            let hashes = self.hashes.borrow();
            let mut groups = self.groups.borrow_mut();
            let mut cand_entries = self.cand_entries.borrow_mut();
            let mut cand_rows = self.cand_rows.borrow_mut();
            for i in 0..n {
                groups[i] = ptr::null_mut();
                let head = self.table.find_chain_tagged(hashes[i]);
                // SAFETY: local entries stay valid until the next flush.
                let entry = unsafe { Entry::next_with_hash(head, hashes[i]) };
                if entry.is_null() {
                    self.missing.push(i as Pos);
                } else {
                    cand_entries[candidates] = entry;
                    cand_rows[candidates] = i as Pos;
                    candidates += 1;
                }
            }
        }

        while candidates > 0 {
            self.retry.clear();
            {
                let cand_entries = self.cand_entries.borrow();
                let cand_rows = self.cand_rows.borrow();
                self.retry
                    .extend((0..candidates).map(|k| (cand_entries[k], cand_rows[k])));
            }
            let matched = self.key_equal.evaluate(candidates);

            let hashes = self.hashes.borrow();
            let mut groups = self.groups.borrow_mut();
            let mut cand_entries = self.cand_entries.borrow_mut();
            let mut cand_rows = self.cand_rows.borrow_mut();
            for k in 0..matched {
                groups[cand_rows[k] as usize] = cand_entries[k];
            }
            // Compaction keeps order, so the rows missing from the matched
            // prefix are exactly the collisions.
            let mut j = 0;
            let mut next = 0;
            for &(entry, row) in &self.retry {
                if j < matched && cand_rows[j] == row {
                    j += 1;
                    continue;
                }
                let hash = hashes[row as usize];
                // SAFETY: as above.
                let entry = unsafe { Entry::next_with_hash((*entry).next, hash) };
                if entry.is_null() {
                    self.missing.push(row);
                } else {
                    cand_entries[next] = entry;
                    cand_rows[next] = row;
                    next += 1;
                }
            }
            candidates = next;
        }
    }

    /// Creates one zeroed, initialized group per distinct key among the
    /// missing rows.
    fn create_missing_groups(&mut self) -> Result<()> {
        if self.missing.is_empty() {
            return Ok(());
        }
        self.pending.clear();
        self.assign.clear();
        let mut created = 0;
        {
            let hashes = self.hashes.borrow();
            let mut new_rows = self.new_rows.borrow_mut();
            for &row in &self.missing {
                let hash = hashes[row as usize];
                let existing = self.pending.find_all(&hash).copied().find(|&index| {
                    let first = new_rows[index as usize];
                    self.rows_equal.iter().all(|eq| eq(first, row))
                });
                let index = match existing {
                    Some(index) => index,
                    None => {
                        let index = created as u32;
                        new_rows[created] = row;
                        created += 1;
                        self.pending.insert(hash, index);
                        index
                    }
                };
                self.assign.push((row, index));
            }
        }

        {
            let hashes = self.hashes.borrow();
            let new_rows = self.new_rows.borrow();
            let mut new_entries = self.new_entries.borrow_mut();
            for k in 0..created {
                let entry = self.alloc.allocate(self.entry_size)?.as_ptr();
                // SAFETY: freshly allocated, `entry_size` bytes long.
                unsafe {
                    entry.write_bytes(0, self.entry_size);
                    (*entry.cast::<Entry>()).hash = hashes[new_rows[k] as usize];
                }
                new_entries[k] = entry.cast();
            }
        }
        self.scatter_keys.evaluate(created);
        self.init.evaluate(created);

        let new_entries = self.new_entries.borrow();
        for &entry in &new_entries[..created] {
            // SAFETY: the entry is initialized and lives until the next flush.
            unsafe { self.table.insert_tagged_exclusive(entry, (*entry).hash) };
            self.local.push(entry);
        }
        let mut groups = self.groups.borrow_mut();
        for &(row, index) in &self.assign {
            groups[row as usize] = new_entries[index as usize];
        }
        Ok(())
    }

    /// Moves every local group into the spill and empties the table.
    fn flush(&mut self) -> Result<()> {
        let Some(spill) = self.spill.as_mut() else {
            return Err(ExecError::ContractViolation(
                "hash group flushed after its spill was published".into(),
            ));
        };
        for &entry in &self.local {
            // SAFETY: local entries are `entry_size` bytes of initialized
            // memory.
            let bytes = unsafe { slice::from_raw_parts(entry.cast::<u8>(), self.entry_size) };
            let hash = unsafe { (*entry).hash };
            spill.push_back(&mut self.spill_alloc, bytes, hash)?;
        }
        tracing::debug!(groups = self.local.len(), spilled = spill.len(), "flushed local groups");
        self.local.clear();
        self.table.clear();
        self.alloc.reset();
        Ok(())
    }

    fn aggregate_local(&mut self) -> Result<()> {
        loop {
            let n = self.child.next()?;
            if n == 0 {
                break;
            }
            if self.local.len() >= self.group_capacity {
                self.flush()?;
            }
            self.compact.evaluate(n);
            self.hash.evaluate(n);
            self.find_groups(n);
            self.create_missing_groups()?;
            self.update.update(n);
        }
        self.flush()?;

        let spill = self.spill.take().ok_or_else(|| {
            ExecError::ContractViolation("hash group spill published twice".into())
        })?;
        let shared = &self.shared;
        shared.spills.lock().push(Arc::new(spill));
        self.barrier.wait_with(|| {
            let spills = shared.spills.lock();
            let groups: usize = spills.iter().map(|s| s.len()).sum();
            tracing::debug!(workers = spills.len(), groups, "hash group local phase done");
        })?;
        self.spills = shared.spills.lock().clone();
        Ok(())
    }

    /// Merges partition `partition` of every spill into `result`.
    fn merge_partition(&mut self, partition: usize) -> Result<()> {
        self.result.clear();
        self.emitted = 0;
        self.table.clear();
        self.alloc.reset();
        for spill in &self.spills {
            for bytes in spill.entries(partition) {
                let src = bytes.as_ptr().cast::<Entry>().cast_mut();
                // SAFETY: spilled entries are complete copies of local groups.
                let hash = unsafe { (*src).hash };
                let mut entry = unsafe { Entry::next_with_hash(self.table.find_chain_tagged(hash), hash) };
                while !entry.is_null() {
                    if self.entries_equal.iter().all(|eq| eq(entry, src)) {
                        break;
                    }
                    // SAFETY: merged entries live until the next partition.
                    entry = unsafe { Entry::next_with_hash((*entry).next, hash) };
                }
                if entry.is_null() {
                    let copy = self.alloc.allocate(self.entry_size)?.as_ptr();
                    // SAFETY: both ranges are `entry_size` bytes and disjoint.
                    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), copy, self.entry_size) };
                    let copy = copy.cast::<Entry>();
                    unsafe { self.table.insert_tagged_exclusive(copy, hash) };
                    self.result.push(copy);
                    if self.result.len() * 10 > self.table.capacity() * 7 {
                        grow(&mut self.table, &self.result);
                    }
                } else {
                    for combine in &self.combine {
                        combine(entry, src);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Doubles the merge table and re-links `groups` into it.
fn grow(table: &mut Hashmap, groups: &[EntryPtr]) {
    table.set_size(groups.len() * 2);
    for &entry in groups {
        // SAFETY: `set_size` emptied every chain.
        unsafe { table.insert_tagged_exclusive(entry, (*entry).hash) };
    }
    tracing::trace!(groups = groups.len(), capacity = table.capacity(), "merge table grown");
}

impl Operator for HashGroup {
    fn next(&mut self) -> Result<usize> {
        if !self.aggregated {
            self.aggregated = true;
            self.aggregate_local()?;
        }
        while self.emitted == self.result.len() {
            let partition = self.shared.next_partition.fetch_add(1, Ordering::Relaxed);
            if partition >= self.partitions {
                self.result.clear();
                self.emitted = 0;
                return Ok(0);
            }
            self.merge_partition(partition)?;
            tracing::debug!(partition, groups = self.result.len(), "merged spill partition");
        }
        let n = self.vector_size.min(self.result.len() - self.emitted);
        self.out_entries.borrow_mut()[..n]
            .copy_from_slice(&self.result[self.emitted..self.emitted + n]);
        self.emitted += n;
        self.gather.evaluate(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use crate::ops::testing::{Batches, drain, read};
    use crate::ops::primitives::{Cmp, sel_cmp};
    use crate::ops::{ResultWriter, Scan, Select};
    use crate::storage::{BlockRelation, Relation};
    use crate::worker::execute;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeMap;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    struct Totals {
        sum: i64,
        min: i64,
        max: i64,
        count: i64,
    }

    fn reference(keys: &[i64], values: &[i64]) -> BTreeMap<i64, Totals> {
        let mut groups = BTreeMap::new();
        for (&k, &v) in keys.iter().zip(values) {
            let t = groups.entry(k).or_insert(Totals {
                sum: 0,
                min: i64::MAX,
                max: i64::MIN,
                count: 0,
            });
            t.sum += v;
            t.min = t.min.min(v);
            t.max = t.max.max(v);
            t.count += 1;
        }
        groups
    }

    /// `SELECT key, sum(v), min(v), max(v), count(*) GROUP BY key`.
    fn run_group(config: &ExecConfig, keys: Vec<i64>, values: Vec<i64>) -> BTreeMap<i64, Totals> {
        let mut relation = Relation::new();
        relation
            .add_column("key", keys)
            .unwrap()
            .add_column("v", values)
            .unwrap();
        let relation = Arc::new(relation);
        let sink = Arc::new(BlockRelation::new());
        execute(config, |ctx| {
            let scan = Scan::new(ctx, relation.clone())?;
            let key = scan.column::<i64>("key")?;
            let v = scan.column::<i64>("v")?;
            let mut group = HashGroupBuilder::new(ctx, Box::new(scan))?;
            let key = group.key(key)?;
            let sum = group.sum(v.clone())?;
            let min = group.min(v.clone())?;
            let max = group.max(v)?;
            let count = group.count()?;
            let group = group.finish()?;
            let mut writer = ResultWriter::new(ctx, Box::new(group), sink.clone());
            writer.column(ctx, "key", key)?;
            writer.column(ctx, "sum", sum)?;
            writer.column(ctx, "min", min)?;
            writer.column(ctx, "max", max)?;
            writer.column(ctx, "count", count)?;
            Ok(Box::new(writer))
        })
        .unwrap();

        let columns: Vec<Vec<i64>> = ["key", "sum", "min", "max", "count"]
            .iter()
            .map(|name| sink.collect::<i64>(name).unwrap())
            .collect();
        let mut groups = BTreeMap::new();
        for i in 0..columns[0].len() {
            let totals = Totals {
                sum: columns[1][i],
                min: columns[2][i],
                max: columns[3][i],
                count: columns[4][i],
            };
            assert!(groups.insert(columns[0][i], totals).is_none(), "group {} emitted twice", columns[0][i]);
        }
        groups
    }

    #[test]
    fn groups_within_one_worker() {
        let keys = vec![3, 1, 3, 2, 1, 3, 3, 7];
        let values = vec![10, 5, -2, 8, 1, 4, 0, 100];
        let config = ExecConfig::default().with_threads(1).with_vector_size(4).with_morsel_size(4);
        let groups = run_group(&config, keys.clone(), values.clone());
        assert_eq!(groups, reference(&keys, &values));
        assert_eq!(
            groups[&3],
            Totals {
                sum: 12,
                min: -2,
                max: 10,
                count: 4
            }
        );
    }

    #[test]
    fn spilled_groups_merge_across_workers() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let n = 60_000;
        let keys: Vec<i64> = (0..n).map(|_| rng.random_range(0..5000)).collect();
        let values: Vec<i64> = (0..n).map(|_| rng.random_range(-1000..1000)).collect();
        let expected = reference(&keys, &values);
        for threads in [1, 4] {
            // Far fewer local slots than groups, so every worker flushes
            // many times.
            let config = ExecConfig::default()
                .with_threads(threads)
                .with_vector_size(256)
                .with_morsel_size(1024)
                .with_group_capacity(512)
                .with_spill_partitions(8);
            assert_eq!(run_group(&config, keys.clone(), values.clone()), expected, "{threads} threads");
        }
    }

    #[test]
    fn single_partition_and_large_batches() {
        let keys: Vec<i64> = (0..10_000).map(|i| i % 777).collect();
        let values: Vec<i64> = (0..10_000).collect();
        let config = ExecConfig::default()
            .with_threads(3)
            .with_vector_size(1024)
            .with_spill_partitions(1);
        assert_eq!(run_group(&config, keys.clone(), values.clone()), reference(&keys, &values));
    }

    #[test]
    fn composite_keys() {
        let mut relation = Relation::new();
        relation
            .add_column("a", vec![1_i32, 1, 2, 1, 2, 2, 1])
            .unwrap()
            .add_column("b", vec![10_i64, 20, 10, 20, 10, 10, 20])
            .unwrap();
        let relation = Arc::new(relation);
        let sink = Arc::new(BlockRelation::new());
        let config = ExecConfig::default().with_threads(2).with_vector_size(5).with_morsel_size(5);
        execute(&config, |ctx| {
            let scan = Scan::new(ctx, relation.clone())?;
            let a = scan.column::<i32>("a")?;
            let b = scan.column::<i64>("b")?;
            let mut group = HashGroupBuilder::new(ctx, Box::new(scan))?;
            let a = group.key(a)?;
            let b = group.key(b)?;
            let count = group.count()?;
            let group = group.finish()?;
            let mut writer = ResultWriter::new(ctx, Box::new(group), sink.clone());
            writer.column(ctx, "a", a)?;
            writer.column(ctx, "b", b)?;
            writer.column(ctx, "count", count)?;
            Ok(Box::new(writer))
        })
        .unwrap();
        let a = sink.collect::<i32>("a").unwrap();
        let b = sink.collect::<i64>("b").unwrap();
        let count = sink.collect::<i64>("count").unwrap();
        let mut rows: Vec<(i32, i64, i64)> = (0..a.len()).map(|i| (a[i], b[i], count[i])).collect();
        rows.sort();
        assert_eq!(rows, vec![(1, 10, 1), (1, 20, 3), (2, 10, 3)]);
    }

    #[test]
    fn empty_input_emits_nothing() {
        let config = ExecConfig::default().with_threads(2);
        let rows = execute(&config, |ctx| {
            let child = Batches::<i64>::new(vec![]);
            let values = child.output();
            let mut group = HashGroupBuilder::new(ctx, Box::new(child))?;
            group.key(values.clone())?;
            group.sum(values)?;
            Ok(Box::new(group.finish()?))
        })
        .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn selection_after_inputs_is_rejected() {
        let config = ExecConfig::default().with_threads(1);
        let result = execute(&config, |ctx| {
            let child = Batches::new(vec![vec![1_i64]]);
            let values = child.output();
            let sel = ctx.vectors().get();
            let mut group = HashGroupBuilder::new(ctx, Box::new(child))?;
            group.key(values)?;
            group.selection(sel)?;
            Ok(Box::new(group.finish()?))
        });
        assert!(matches!(result, Err(ExecError::ContractViolation(_))));
    }

    #[test]
    fn aggregates_may_precede_keys() {
        let keys: Vec<i64> = (0..2000).map(|i| i % 37).collect();
        let values: Vec<i64> = (0..2000).collect();
        let expected = reference(&keys, &values);
        let mut relation = Relation::new();
        relation
            .add_column("key", keys)
            .unwrap()
            .add_column("v", values)
            .unwrap();
        let relation = Arc::new(relation);
        let sink = Arc::new(BlockRelation::new());
        let config = ExecConfig::default()
            .with_threads(3)
            .with_vector_size(64)
            .with_morsel_size(128)
            .with_group_capacity(8);
        execute(&config, |ctx| {
            let scan = Scan::new(ctx, relation.clone())?;
            let key = scan.column::<i64>("key")?;
            let v = scan.column::<i64>("v")?;
            let mut group = HashGroupBuilder::new(ctx, Box::new(scan))?;
            let sum = group.sum(v)?;
            let key = group.key(key)?;
            let group = group.finish()?;
            let mut writer = ResultWriter::new(ctx, Box::new(group), sink.clone());
            writer.column(ctx, "key", key)?;
            writer.column(ctx, "sum", sum)?;
            Ok(Box::new(writer))
        })
        .unwrap();
        let key = sink.collect::<i64>("key").unwrap();
        let sum = sink.collect::<i64>("sum").unwrap();
        let groups: BTreeMap<i64, i64> = key.into_iter().zip(sum).collect();
        assert_eq!(groups.len(), expected.len());
        for (k, totals) in expected {
            assert_eq!(groups[&k], totals.sum, "key {k}");
        }
    }

    #[test]
    fn signed_zeros_are_one_group() {
        // Every worker sees both zeros, and a capacity of one group forces
        // them through the spill merge.
        let keys: Vec<f64> = (0..400)
            .map(|i| match i % 3 {
                0 => 0.0,
                1 => -0.0,
                _ => 2.5,
            })
            .collect();
        let mut relation = Relation::new();
        relation.add_column("key", keys).unwrap();
        let relation = Arc::new(relation);
        let sink = Arc::new(BlockRelation::new());
        let config = ExecConfig::default()
            .with_threads(2)
            .with_vector_size(4)
            .with_morsel_size(8)
            .with_group_capacity(1);
        execute(&config, |ctx| {
            let scan = Scan::new(ctx, relation.clone())?;
            let key = scan.column::<f64>("key")?;
            let mut group = HashGroupBuilder::new(ctx, Box::new(scan))?;
            let key = group.key(key)?;
            let count = group.count()?;
            let group = group.finish()?;
            let mut writer = ResultWriter::new(ctx, Box::new(group), sink.clone());
            writer.column(ctx, "key", key)?;
            writer.column(ctx, "count", count)?;
            Ok(Box::new(writer))
        })
        .unwrap();
        let key = sink.collect::<f64>("key").unwrap();
        let count = sink.collect::<i64>("count").unwrap();
        assert_eq!(key.len(), 2);
        for (k, c) in key.into_iter().zip(count) {
            if k == 0.0 {
                assert_eq!(c, 267);
            } else {
                assert_eq!((k, c), (2.5, 133));
            }
        }
    }

    #[test]
    fn groups_only_selected_rows() {
        let keys: Vec<i64> = (0..5000).map(|i| i % 13).collect();
        let values: Vec<i64> = (0..5000).map(|i| i % 100).collect();
        let (kept_keys, kept_values): (Vec<i64>, Vec<i64>) = keys
            .iter()
            .zip(&values)
            .filter(|&(_, &v)| v >= 40)
            .map(|(&k, &v)| (k, v))
            .unzip();
        let expected = reference(&kept_keys, &kept_values);

        let mut relation = Relation::new();
        relation
            .add_column("key", keys)
            .unwrap()
            .add_column("v", values)
            .unwrap();
        let relation = Arc::new(relation);
        let sink = Arc::new(BlockRelation::new());
        let config = ExecConfig::default()
            .with_threads(2)
            .with_vector_size(128)
            .with_morsel_size(512)
            .with_group_capacity(4);
        execute(&config, |ctx| {
            let scan = Scan::new(ctx, relation.clone())?;
            let key = scan.column::<i64>("key")?;
            let v = scan.column::<i64>("v")?;
            let sel = ctx.vectors().get();
            let mut predicate = Expression::new();
            predicate.add(sel_cmp(v.clone(), Cmp::Ge, 40, sel.clone()));
            let select = Select::new(Box::new(scan), predicate);
            let mut group = HashGroupBuilder::new(ctx, Box::new(select))?;
            group.selection(sel)?;
            let key = group.key(key)?;
            let sum = group.sum(v.clone())?;
            let min = group.min(v.clone())?;
            let max = group.max(v)?;
            let count = group.count()?;
            let group = group.finish()?;
            let mut writer = ResultWriter::new(ctx, Box::new(group), sink.clone());
            writer.column(ctx, "key", key)?;
            writer.column(ctx, "sum", sum)?;
            writer.column(ctx, "min", min)?;
            writer.column(ctx, "max", max)?;
            writer.column(ctx, "count", count)?;
            Ok(Box::new(writer))
        })
        .unwrap();
        let columns: Vec<Vec<i64>> = ["key", "sum", "min", "max", "count"]
            .iter()
            .map(|name| sink.collect::<i64>(name).unwrap())
            .collect();
        let groups: BTreeMap<i64, Totals> = (0..columns[0].len())
            .map(|i| {
                let totals = Totals {
                    sum: columns[1][i],
                    min: columns[2][i],
                    max: columns[3][i],
                    count: columns[4][i],
                };
                (columns[0][i], totals)
            })
            .collect();
        assert_eq!(groups, expected);
    }

    #[test]
    fn emits_in_vector_sized_batches() {
        let config = ExecConfig::default().with_threads(1).with_vector_size(8).with_morsel_size(8);
        let sizes = std::sync::Mutex::new(Vec::new());
        execute(&config, |ctx| {
            let child = Batches::<i64>::new(vec![(0..8).collect(), (8..16).collect(), (0..4).collect()]);
            let values = child.output();
            let mut group = HashGroupBuilder::new(ctx, Box::new(child))?;
            let key = group.key(values)?;
            let count = group.count()?;
            let mut group = group.finish()?;
            let mut seen = Vec::new();
            loop {
                let n = group.next()?;
                if n == 0 {
                    break;
                }
                assert!(n <= 8);
                seen.extend(read(&key, n).into_iter().zip(read(&count, n)));
            }
            sizes.lock().unwrap().extend(drain(&mut group, 8));
            seen.sort();
            let expected: Vec<(i64, i64)> = (0..16).map(|k| (k, if k < 4 { 2 } else { 1 })).collect();
            assert_eq!(seen, expected);
            Ok(Box::new(group))
        })
        .unwrap();
        assert!(sizes.lock().unwrap().is_empty());
    }
}

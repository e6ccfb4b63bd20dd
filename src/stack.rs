//! Append-only record storage with stable addresses.
//!
//! Records have a fixed byte size chosen at construction. [`push_batch`]
//! reserves `n` contiguous, zeroed records; once handed out a record never
//! moves, so pointers to it can be linked into hash chains.
//!
//! [`push_batch`]: Stack::push_batch

use std::ptr::NonNull;

use crate::error::Result;
use crate::mem::Allocator;

const DEFAULT_SEGMENT_RECORDS: usize = 4096;

struct Segment {
    base: NonNull<u8>,
    capacity: usize,
    len: usize,
}

pub struct Stack {
    alloc: Allocator,
    record_size: usize,
    segments: Vec<Segment>,
    len: usize,
}

impl Stack {
    pub fn new(alloc: Allocator, record_size: usize) -> Self {
        Self {
            alloc,
            record_size: record_size.max(1),
            segments: Vec::new(),
            len: 0,
        }
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserves `n` zeroed records and returns the first one. The records
    /// are contiguous: record `i` starts at `ptr + i * record_size`.
    pub fn push_batch(&mut self, n: usize) -> Result<NonNull<u8>> {
        let size = self.record_size;
        let fits = self
            .segments
            .last()
            .is_some_and(|s| s.capacity - s.len >= n);
        if !fits {
            let capacity = n.max(DEFAULT_SEGMENT_RECORDS);
            let base = self.alloc.allocate(capacity * size)?;
            self.segments.push(Segment {
                base,
                capacity,
                len: 0,
            });
        }
        let Some(segment) = self.segments.last_mut() else {
            unreachable!("a segment was pushed above");
        };
        // SAFETY: `len + n <= capacity`, so the range is inside the segment.
        let start = unsafe { segment.base.add(segment.len * size) };
        unsafe { start.as_ptr().write_bytes(0, n * size) };
        segment.len += n;
        self.len += n;
        Ok(start)
    }

    /// Filled part of every segment as `(first record, record count)`.
    pub fn segments(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        self.segments.iter().map(|s| (s.base, s.len))
    }

    /// Every record, in push order.
    pub fn records(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let size = self.record_size;
        self.segments().flat_map(move |(base, len)| {
            // SAFETY: `i < len` stays inside the filled part.
            (0..len).map(move |i| unsafe { base.add(i * size) })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::GlobalPool;

    #[test]
    fn batches_are_contiguous_zeroed_and_stable() {
        let pool = GlobalPool::new(1 << 20).unwrap();
        let mut stack = Stack::new(Allocator::new(pool), 24);
        let first = stack.push_batch(10).unwrap();
        for i in 0..10 {
            let record = unsafe { first.add(i * 24) };
            assert!(unsafe { std::slice::from_raw_parts(record.as_ptr(), 24) }
                .iter()
                .all(|&b| b == 0));
            unsafe { record.cast::<u64>().write(i as u64) };
        }
        // Forces a second segment.
        stack.push_batch(DEFAULT_SEGMENT_RECORDS).unwrap();
        assert_eq!(stack.segments().count(), 2);
        assert_eq!(stack.len(), 10 + DEFAULT_SEGMENT_RECORDS);

        let values: Vec<u64> = stack
            .records()
            .take(10)
            .map(|r| unsafe { r.cast::<u64>().read() })
            .collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        assert_eq!(stack.records().next(), Some(first));
    }

    #[test]
    fn oversized_batch_gets_its_own_segment() {
        let pool = GlobalPool::new(1 << 16).unwrap();
        let mut stack = Stack::new(Allocator::new(pool), 8);
        stack.push_batch(3).unwrap();
        stack.push_batch(DEFAULT_SEGMENT_RECORDS * 2).unwrap();
        let lens: Vec<usize> = stack.segments().map(|(_, len)| len).collect();
        assert_eq!(lens, vec![3, DEFAULT_SEGMENT_RECORDS * 2]);
    }
}

//! Append-only spill storage partitioned by the high bits of a hash.
//!
//! Each partition is a singly linked chain of fixed-capacity chunks drawn
//! from the owner's [`Allocator`]. One deque is written by exactly one thread.
//! Once published (e.g. behind an `Arc` after a barrier) it is read-only and
//! any thread may iterate any partition.

use std::mem::size_of;
use std::ptr;
use std::slice;

use crate::error::Result;
use crate::mem::{ALIGN, Allocator};

const CHUNK_BYTES: usize = 64 * 1024;

#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    count: usize,
}

const CHUNK_HEADER: usize = size_of::<ChunkHeader>();
const _: () = assert!(CHUNK_HEADER % ALIGN == 0);

impl ChunkHeader {
    #[inline(always)]
    fn data(chunk: *mut ChunkHeader) -> *mut u8 {
        // SAFETY: every chunk is allocated with room for the header.
        unsafe { chunk.cast::<u8>().add(CHUNK_HEADER) }
    }
}

#[derive(Clone, Copy)]
struct Partition {
    first: *mut ChunkHeader,
    last: *mut ChunkHeader,
}

pub struct PartitionedDeque {
    partitions: Vec<Partition>,
    bits: u32,
    entry_size: usize,
    chunk_capacity: usize,
    len: usize,
}

// SAFETY: chunks live in pool memory that outlives the deque's readers. The
// deque is only mutated through `&mut self`.
unsafe impl Send for PartitionedDeque {}
unsafe impl Sync for PartitionedDeque {}

impl PartitionedDeque {
    /// `partitions` is rounded up to a power of two.
    pub fn new(partitions: usize, entry_size: usize) -> Self {
        let count = partitions.max(1).next_power_of_two();
        let entry_size = entry_size.max(1);
        Self {
            partitions: vec![
                Partition {
                    first: ptr::null_mut(),
                    last: ptr::null_mut(),
                };
                count
            ],
            bits: count.trailing_zeros(),
            entry_size,
            chunk_capacity: ((CHUNK_BYTES - CHUNK_HEADER) / entry_size).max(1),
            len: 0,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Partition selected by the top bits of `hash`.
    #[inline(always)]
    pub fn partition_of(&self, hash: u64) -> usize {
        if self.bits == 0 {
            0
        } else {
            (hash >> (64 - self.bits)) as usize
        }
    }

    /// Appends a copy of `element` (exactly one entry long) to the partition
    /// of `hash`.
    pub fn push_back(&mut self, alloc: &mut Allocator, element: &[u8], hash: u64) -> Result<()> {
        debug_assert_eq!(element.len(), self.entry_size);
        let slot = self.slot(alloc, hash)?;
        // SAFETY: `slot` has room for one entry and does not overlap `element`.
        unsafe { ptr::copy_nonoverlapping(element.as_ptr(), slot, self.entry_size) };
        Ok(())
    }

    fn slot(&mut self, alloc: &mut Allocator, hash: u64) -> Result<*mut u8> {
        let index = self.partition_of(hash);
        let partition = self.partitions[index];
        let mut chunk = partition.last;
        // SAFETY: non-null chunks were initialized by `new_chunk`.
        if chunk.is_null() || unsafe { (*chunk).count } == self.chunk_capacity {
            let fresh = self.new_chunk(alloc)?;
            if chunk.is_null() {
                self.partitions[index].first = fresh;
            } else {
                unsafe { (*chunk).next = fresh };
            }
            self.partitions[index].last = fresh;
            chunk = fresh;
        }
        self.len += 1;
        unsafe {
            let count = (*chunk).count;
            (*chunk).count = count + 1;
            Ok(ChunkHeader::data(chunk).add(count * self.entry_size))
        }
    }

    fn new_chunk(&self, alloc: &mut Allocator) -> Result<*mut ChunkHeader> {
        let chunk = alloc
            .allocate(CHUNK_HEADER + self.chunk_capacity * self.entry_size)?
            .cast::<ChunkHeader>()
            .as_ptr();
        // SAFETY: freshly allocated and large enough for the header.
        unsafe {
            chunk.write(ChunkHeader {
                next: ptr::null_mut(),
                count: 0,
            })
        };
        Ok(chunk)
    }

    /// Entries of `partition`, in insertion order.
    pub fn entries(&self, partition: usize) -> Entries<'_> {
        Entries {
            deque: self,
            chunk: self.partitions[partition].first,
            index: 0,
        }
    }

    pub fn partition_len(&self, partition: usize) -> usize {
        let mut chunk = self.partitions[partition].first;
        let mut len = 0;
        while !chunk.is_null() {
            // SAFETY: chains only hold initialized chunks.
            unsafe {
                len += (*chunk).count;
                chunk = (*chunk).next;
            }
        }
        len
    }
}

pub struct Entries<'a> {
    deque: &'a PartitionedDeque,
    chunk: *mut ChunkHeader,
    index: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        // SAFETY: chunks are initialized and the deque is borrowed immutably,
        // so counts do not change while iterating.
        unsafe {
            while !self.chunk.is_null() && self.index == (*self.chunk).count {
                self.chunk = (*self.chunk).next;
                self.index = 0;
            }
            if self.chunk.is_null() {
                return None;
            }
            let size = self.deque.entry_size;
            let entry = ChunkHeader::data(self.chunk).add(self.index * size);
            self.index += 1;
            Some(slice::from_raw_parts(entry, size))
        }
    }
}

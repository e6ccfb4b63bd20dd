//! Concurrent chained hash index with per-slot tag filters.
//!
//! Entries are pool-allocated records: an [`Entry`] header followed by an
//! inline payload whose layout is fixed per query. The table is an array of
//! atomic head pointers. New entries are prepended with a CAS loop.
//!
//! # Tags
//!
//! ```text
//!   slot word (64 bits)
//!  ┌──────────────────┬────────────────────────────────────────────┐
//!  │ tag bits [63:48] │ head entry address [47:0]                  │
//!  └──────────────────┴────────────────────────────────────────────┘
//! ```
//!
//! Every insert ORs a one-hot bit, chosen by the top four bits of the hash,
//! into the slot. If the bit for a hash is clear, no entry with that hash was
//! ever inserted into the chain. A set bit can be a false positive, so chain
//! walks must still compare `entry.hash`. Tags are folded in with strict
//! provenance `map_addr`.
//!
//! On x86-64 with AVX2 the eight-lane lookup gathers slot words with
//! `vpgatherqq` and tests their tags in vector registers. Gathered words are
//! plain integers, so inserts expose the provenance of their entries and the
//! vector path rebuilds head pointers from it.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{ExecError, Result};
use crate::hash::{HashKey, SEED};
use crate::mem::{ALIGN, Allocator, GlobalPool};

const _: () = assert!(usize::BITS == 64, "tagged slots need 64-bit pointers");

const ADDRESS_MASK: usize = (1 << 48) - 1;
const TAG_SHIFT: u32 = 48;

/// Lanes processed by [`Hashmap::find_chain_tagged_batch`].
pub const LANES: usize = 8;

/// Header of every hash table entry. The payload follows immediately.
#[repr(C)]
#[derive(Debug)]
pub struct Entry {
    pub next: *mut Entry,
    pub hash: u64,
}

pub type EntryPtr = *mut Entry;

impl Entry {
    /// Byte size of the header, i.e. the offset of the first payload byte.
    pub const HEADER: usize = size_of::<Entry>();

    /// Pointer to the payload field at byte `offset` from the start of the
    /// entry.
    ///
    /// # Safety
    ///
    /// `entry` must point to an entry at least `offset + size_of::<T>()` bytes
    /// long, and `offset` must be suitably aligned for `T`.
    #[inline(always)]
    pub unsafe fn field<T>(entry: EntryPtr, offset: usize) -> *mut T {
        unsafe { entry.cast::<u8>().add(offset).cast::<T>() }
    }

    /// First entry at or after `entry` in its chain whose hash is `hash`.
    ///
    /// # Safety
    ///
    /// `entry` must be null or point into a published chain.
    #[inline]
    pub unsafe fn next_with_hash(mut entry: EntryPtr, hash: u64) -> EntryPtr {
        unsafe {
            while !entry.is_null() && (*entry).hash != hash {
                entry = (*entry).next;
            }
        }
        entry
    }
}

/// One-hot tag for `hash`, positioned in the top 16 bits of a slot word.
#[inline(always)]
pub fn tag(hash: u64) -> usize {
    1usize << (TAG_SHIFT + (hash >> 60) as u32)
}

#[inline(always)]
fn untag(p: EntryPtr) -> EntryPtr {
    p.map_addr(|a| a & ADDRESS_MASK)
}

#[inline(always)]
fn with_tags(entry: EntryPtr, old_head: EntryPtr, hash: u64) -> EntryPtr {
    entry.map_addr(|a| a | (old_head.addr() & !ADDRESS_MASK) | tag(hash))
}

/// Hash index over atomic head pointers. See the module docs.
pub struct Hashmap {
    slots: Box<[AtomicPtr<Entry>]>,
    mask: u64,
    avx2: bool,
}

impl Default for Hashmap {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl Hashmap {
    pub fn with_capacity(n: usize) -> Self {
        let mut map = Self {
            slots: Box::new([]),
            mask: 0,
            avx2: has_avx2(),
        };
        map.set_size(n);
        map
    }

    /// Resizes the slot array to a power of two of at least `n / 0.7` slots
    /// (minimum 16) and empties the table.
    pub fn set_size(&mut self, n: usize) {
        let capacity = ((n as f64 / 0.7).ceil() as usize)
            .max(16)
            .next_power_of_two();
        self.slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        self.mask = capacity as u64 - 1;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    fn slot(&self, hash: u64) -> &AtomicPtr<Entry> {
        &self.slots[(hash & self.mask) as usize]
    }

    /// Prepends `entry` to its chain without touching tags.
    ///
    /// # Safety
    ///
    /// `entry` must be a valid entry that outlives the table and is not yet
    /// part of any chain.
    pub unsafe fn insert(&self, entry: EntryPtr, hash: u64) {
        let slot = self.slot(hash);
        let _ = entry.expose_provenance();
        let mut head = slot.load(Ordering::Relaxed);
        loop {
            unsafe { (*entry).next = head };
            match slot.compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Prepends `entry` to its chain and sets the tag bit for `hash`.
    ///
    /// # Safety
    ///
    /// Same as [`insert`](Self::insert).
    pub unsafe fn insert_tagged(&self, entry: EntryPtr, hash: u64) {
        let slot = self.slot(hash);
        let _ = entry.expose_provenance();
        let mut head = slot.load(Ordering::Relaxed);
        loop {
            unsafe { (*entry).next = untag(head) };
            let new_head = with_tags(entry, head, hash);
            match slot.compare_exchange_weak(head, new_head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Non-atomic variant of [`insert_tagged`](Self::insert_tagged) for tables
    /// owned by a single thread.
    ///
    /// # Safety
    ///
    /// Same as [`insert`](Self::insert).
    #[inline]
    pub unsafe fn insert_tagged_exclusive(&mut self, entry: EntryPtr, hash: u64) {
        let slot = self.slots[(hash & self.mask) as usize].get_mut();
        let _ = entry.expose_provenance();
        let head = *slot;
        unsafe { (*entry).next = untag(head) };
        *slot = with_tags(entry, head, hash);
    }

    /// Head of the chain for `hash`, ignoring tags. Null if empty.
    #[inline]
    pub fn find_chain(&self, hash: u64) -> EntryPtr {
        untag(self.slot(hash).load(Ordering::Acquire))
    }

    /// Head of the chain for `hash` if the tag filter admits `hash`, null
    /// otherwise.
    #[inline]
    pub fn find_chain_tagged(&self, hash: u64) -> EntryPtr {
        let candidate = self.slot(hash).load(Ordering::Acquire);
        if candidate.addr() & tag(hash) != 0 {
            untag(candidate)
        } else {
            ptr::null_mut()
        }
    }

    /// Eight-lane [`find_chain_tagged`](Self::find_chain_tagged). Bit `l` of
    /// the returned mask is set when lane `l` may have a match; the pointer
    /// of a cleared lane is null.
    ///
    /// # Safety
    ///
    /// No insert may run concurrently: the vector path reads slots with
    /// plain loads.
    #[inline]
    pub unsafe fn find_chain_tagged_batch(&self, hashes: &[u64; LANES]) -> ([EntryPtr; LANES], u8) {
        #[cfg(target_arch = "x86_64")]
        {
            if self.avx2 {
                // SAFETY: AVX2 was detected when the table was created.
                return unsafe { self.find_chain_tagged_batch_avx2(hashes) };
            }
        }
        self.find_chain_tagged_batch_scalar(hashes)
    }

    fn find_chain_tagged_batch_scalar(&self, hashes: &[u64; LANES]) -> ([EntryPtr; LANES], u8) {
        let mut positions = [0usize; LANES];
        for l in 0..LANES {
            positions[l] = (hashes[l] & self.mask) as usize;
        }
        let mut heads = [ptr::null_mut(); LANES];
        for l in 0..LANES {
            heads[l] = self.slots[positions[l]].load(Ordering::Acquire);
        }
        let mut mask = 0u8;
        for l in 0..LANES {
            let hit = heads[l].addr() & tag(hashes[l]) != 0;
            mask |= (hit as u8) << l;
            heads[l] = if hit { untag(heads[l]) } else { ptr::null_mut() };
        }
        (heads, mask)
    }

    /// Two four-lane gathers of slot words, masked by the one-hot tags of
    /// their hashes.
    #[cfg(target_arch = "x86_64")]
    #[target_feature(enable = "avx2")]
    unsafe fn find_chain_tagged_batch_avx2(&self, hashes: &[u64; LANES]) -> ([EntryPtr; LANES], u8) {
        use std::arch::x86_64::*;

        let base = self.slots.as_ptr().cast::<i64>();
        let slot_mask = _mm256_set1_epi64x(self.mask as i64);
        let tag_shift = _mm256_set1_epi64x(TAG_SHIFT as i64);
        let one = _mm256_set1_epi64x(1);
        let zero = _mm256_setzero_si256();

        let mut words = [0u64; LANES];
        let mut mask = 0u8;
        for half in 0..2 {
            let lanes = half * 4;
            // SAFETY: `hashes` holds eight u64, `lanes + 4 <= LANES`; every
            // gathered index is masked into the slot array.
            unsafe {
                let h = _mm256_loadu_si256(hashes.as_ptr().add(lanes).cast());
                let index = _mm256_and_si256(h, slot_mask);
                let slot = _mm256_i64gather_epi64::<8>(base, index);
                let shift = _mm256_add_epi64(_mm256_srli_epi64::<60>(h), tag_shift);
                let tags = _mm256_sllv_epi64(one, shift);
                let miss = _mm256_cmpeq_epi64(_mm256_and_si256(slot, tags), zero);
                let hits = !_mm256_movemask_pd(_mm256_castsi256_pd(miss)) & 0xf;
                mask |= (hits as u8) << lanes;
                _mm256_storeu_si256(words.as_mut_ptr().add(lanes).cast(), slot);
            }
        }

        let mut heads = [ptr::null_mut(); LANES];
        for l in 0..LANES {
            if mask & (1 << l) != 0 {
                heads[l] = untag(ptr::with_exposed_provenance_mut(words[l] as usize));
            }
        }
        (heads, mask)
    }

    /// Empties every chain. Entries themselves are owned by their allocator.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.get_mut() = ptr::null_mut();
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2")
}

#[cfg(not(target_arch = "x86_64"))]
fn has_avx2() -> bool {
    false
}

/// Hash function for typed keys of [`Hashmapx`] and [`Hashset`].
pub trait KeyHasher<K> {
    fn hash(key: &K) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyHasher;

impl<K: HashKey> KeyHasher<K> for DefaultKeyHasher {
    #[inline(always)]
    fn hash(key: &K) -> u64 {
        key.hash_key(SEED)
    }
}

/// For keys that already are hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHasher;

impl KeyHasher<u64> for IdentityHasher {
    #[inline(always)]
    fn hash(key: &u64) -> u64 {
        *key
    }
}

#[repr(C)]
struct TypedEntry<K, V> {
    header: Entry,
    key: K,
    value: V,
}

/// Typed map over [`Hashmap`]. Entries come from the caller's
/// [`Allocator`]; the map keeps the pool alive so returned references stay
/// valid.
pub struct Hashmapx<K, V, H = DefaultKeyHasher> {
    map: Hashmap,
    pool: Arc<GlobalPool>,
    _marker: PhantomData<(K, V, H)>,
}

impl<K, V, H> Hashmapx<K, V, H>
where
    K: Copy + PartialEq,
    V: Copy,
    H: KeyHasher<K>,
{
    pub fn new(pool: Arc<GlobalPool>, size: usize) -> Result<Self> {
        if align_of::<TypedEntry<K, V>>() > ALIGN {
            return Err(ExecError::Layout(format!(
                "entry alignment {} exceeds {ALIGN}",
                align_of::<TypedEntry<K, V>>()
            )));
        }
        Ok(Self {
            map: Hashmap::with_capacity(size),
            pool,
            _marker: PhantomData,
        })
    }

    fn create(&self, alloc: &mut Allocator, key: K, value: V, hash: u64) -> Result<EntryPtr> {
        debug_assert!(Arc::ptr_eq(alloc.pool(), &self.pool));
        let raw = alloc
            .allocate(size_of::<TypedEntry<K, V>>())?
            .cast::<TypedEntry<K, V>>();
        // SAFETY: freshly allocated, aligned and large enough.
        unsafe {
            raw.as_ptr().write(TypedEntry {
                header: Entry {
                    next: ptr::null_mut(),
                    hash,
                },
                key,
                value,
            });
        }
        Ok(raw.as_ptr().cast::<Entry>())
    }

    /// Inserts `(key, value)`. Safe to call from several threads at once,
    /// each with its own allocator. Duplicate keys are kept.
    pub fn insert(&self, alloc: &mut Allocator, key: K, value: V) -> Result<()> {
        let hash = H::hash(&key);
        let entry = self.create(alloc, key, value, hash)?;
        // SAFETY: the entry lives in pool memory owned by `self.pool`.
        unsafe { self.map.insert_tagged(entry, hash) };
        Ok(())
    }

    fn find_entry(&self, key: &K, hash: u64) -> Option<*mut TypedEntry<K, V>> {
        let mut entry = self.map.find_chain_tagged(hash);
        // SAFETY: chains only contain entries created by `create`.
        unsafe {
            loop {
                entry = Entry::next_with_hash(entry, hash);
                if entry.is_null() {
                    return None;
                }
                let typed = entry.cast::<TypedEntry<K, V>>();
                if (*typed).key == *key {
                    return Some(typed);
                }
                entry = (*entry).next;
            }
        }
    }

    pub fn find_one(&self, key: &K) -> Option<&V> {
        let hash = H::hash(key);
        // SAFETY: entries are never freed while the pool is alive.
        self.find_entry(key, hash).map(|e| unsafe { &(*e).value })
    }

    /// Returns the value for `key`, creating it from `init` first if absent.
    /// Single-threaded: takes `&mut self`.
    pub fn find_or_create(
        &mut self,
        alloc: &mut Allocator,
        key: K,
        init: impl FnOnce() -> V,
    ) -> Result<&mut V> {
        let hash = H::hash(&key);
        let typed = match self.find_entry(&key, hash) {
            Some(e) => e,
            None => {
                let entry = self.create(alloc, key, init(), hash)?;
                // SAFETY: exclusive access through `&mut self`.
                unsafe { self.map.insert_tagged_exclusive(entry, hash) };
                entry.cast::<TypedEntry<K, V>>()
            }
        };
        // SAFETY: `&mut self` guarantees no other reference into the table.
        Ok(unsafe { &mut (*typed).value })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.find_entry(key, H::hash(key)).is_some()
    }
}

/// Typed set over [`Hashmap`].
pub struct Hashset<K, H = DefaultKeyHasher> {
    inner: Hashmapx<K, (), H>,
}

impl<K, H> Hashset<K, H>
where
    K: Copy + PartialEq,
    H: KeyHasher<K>,
{
    pub fn new(pool: Arc<GlobalPool>, size: usize) -> Result<Self> {
        Ok(Self {
            inner: Hashmapx::new(pool, size)?,
        })
    }

    /// Adds `key` unconditionally; concurrent callers may add duplicates.
    pub fn insert(&self, alloc: &mut Allocator, key: K) -> Result<()> {
        self.inner.insert(alloc, key, ())
    }

    /// Adds `key` unless present. Returns whether it was added.
    pub fn insert_unique(&mut self, alloc: &mut Allocator, key: K) -> Result<bool> {
        if self.inner.contains(&key) {
            return Ok(false);
        }
        self.inner.find_or_create(alloc, key, || ())?;
        Ok(true)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }
}

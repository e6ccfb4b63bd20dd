//! Resizable, single-threaded scratch map used inside one primitive call.
//!
//! A directory of chain heads points into a flat storage array; chains are
//! linked through storage indices. Both arrays are kept across [`clear`], so a
//! map reused for every batch stops allocating once it has reached its
//! working size.
//!
//! [`clear`]: HashmapSmall::clear

use std::marker::PhantomData;

use crate::hashmap::{DefaultKeyHasher, KeyHasher};

const EMPTY: u32 = u32::MAX;
const MIN_DIRECTORY: usize = 16;

struct Slot<K, V> {
    next: u32,
    hash: u64,
    key: K,
    value: V,
}

pub struct HashmapSmall<K, V, H = DefaultKeyHasher> {
    directory: Vec<u32>,
    storage: Vec<Slot<K, V>>,
    mask: u64,
    _hasher: PhantomData<H>,
}

impl<K, V, H> HashmapSmall<K, V, H>
where
    K: Copy + PartialEq,
    V: Copy,
    H: KeyHasher<K>,
{
    pub fn with_capacity(n: usize) -> Self {
        let size = (n * 2).max(MIN_DIRECTORY).next_power_of_two();
        Self {
            directory: vec![EMPTY; size],
            storage: Vec::with_capacity(n),
            mask: size as u64 - 1,
            _hasher: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Number of directory slots.
    pub fn capacity(&self) -> usize {
        self.directory.len()
    }

    /// Adds `(key, value)`; an existing entry with the same key is kept and
    /// still reachable through [`find_all`](Self::find_all).
    pub fn insert(&mut self, key: K, value: V) {
        if self.storage.len() >= self.directory.len() / 2 {
            self.grow();
        }
        let hash = H::hash(&key);
        let pos = (hash & self.mask) as usize;
        let index = self.storage.len() as u32;
        self.storage.push(Slot {
            next: self.directory[pos],
            hash,
            key,
            value,
        });
        self.directory[pos] = index;
    }

    fn grow(&mut self) {
        let size = self.directory.len() * 2;
        self.directory.clear();
        self.directory.resize(size, EMPTY);
        self.mask = size as u64 - 1;
        for (i, slot) in self.storage.iter_mut().enumerate() {
            let pos = (slot.hash & self.mask) as usize;
            slot.next = self.directory[pos];
            self.directory[pos] = i as u32;
        }
        tracing::trace!(capacity = size, "small map grown");
    }

    fn find_index(&self, key: &K, hash: u64, mut index: u32) -> Option<usize> {
        while index != EMPTY {
            let slot = &self.storage[index as usize];
            if slot.hash == hash && slot.key == *key {
                return Some(index as usize);
            }
            index = slot.next;
        }
        None
    }

    /// Most recently inserted value for `key`.
    pub fn find(&self, key: &K) -> Option<&V> {
        let hash = H::hash(key);
        let head = self.directory[(hash & self.mask) as usize];
        self.find_index(key, hash, head)
            .map(|i| &self.storage[i].value)
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        let hash = H::hash(key);
        let head = self.directory[(hash & self.mask) as usize];
        self.find_index(key, hash, head)
            .map(|i| &mut self.storage[i].value)
    }

    /// Every value stored under `key`, newest first.
    pub fn find_all<'a>(&'a self, key: &'a K) -> FindAll<'a, K, V, H> {
        let hash = H::hash(key);
        FindAll {
            map: self,
            key,
            hash,
            index: self.directory[(hash & self.mask) as usize],
        }
    }

    /// Removes every entry. Resets only the touched directory slots when the
    /// map is sparsely filled, the whole directory otherwise.
    pub fn clear(&mut self) {
        if self.storage.len() * 4 < self.directory.len() {
            for slot in &self.storage {
                self.directory[(slot.hash & self.mask) as usize] = EMPTY;
            }
        } else {
            self.directory.fill(EMPTY);
        }
        self.storage.clear();
    }
}

pub struct FindAll<'a, K, V, H> {
    map: &'a HashmapSmall<K, V, H>,
    key: &'a K,
    hash: u64,
    index: u32,
}

impl<'a, K, V, H> Iterator for FindAll<'a, K, V, H>
where
    K: Copy + PartialEq,
    V: Copy,
    H: KeyHasher<K>,
{
    type Item = &'a V;

    fn next(&mut self) -> Option<&'a V> {
        let found = self.map.find_index(self.key, self.hash, self.index)?;
        let slot = &self.map.storage[found];
        self.index = slot.next;
        Some(&slot.value)
    }
}

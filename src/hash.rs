//! Hash functions for join and group keys.
//!
//! Hash tables select slots from the low bits of a hash, spill partitions from
//! the high bits and chain tags from the top four bits, so the finalizer must
//! mix every input bit into both ends of the word.

/// Seed for the first key column of a composite key.
pub const SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// murmur3 64-bit finalizer.
#[inline(always)]
pub fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Folds the hash of another key column into an existing hash.
#[inline(always)]
pub fn hash_combine(hash: u64, next: u64) -> u64 {
    fmix64(hash ^ next.wrapping_add(SEED).wrapping_add(hash << 6).wrapping_add(hash >> 2))
}

pub trait HashKey {
    fn hash_key(&self, seed: u64) -> u64;
}

macro_rules! impl_hash_key_int {
    ($($t:ty),*) => {
        $(
            impl HashKey for $t {
                #[inline(always)]
                fn hash_key(&self, seed: u64) -> u64 {
                    fmix64((*self as u64) ^ seed)
                }
            }
        )*
    };
}

impl_hash_key_int!(i32, i64, u32, u64);

impl HashKey for f64 {
    /// `-0.0` hashes like `0.0` because the two compare equal.
    #[inline(always)]
    fn hash_key(&self, seed: u64) -> u64 {
        fmix64((*self + 0.0).to_bits() ^ seed)
    }
}

impl<const N: usize> HashKey for [u8; N] {
    fn hash_key(&self, seed: u64) -> u64 {
        let mut h = seed;
        for chunk in self.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            h = fmix64(h ^ u64::from_le_bytes(word));
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn no_catastrophic_collisions() {
        let mut seen = HashSet::new();
        for key in 0..10_000_i64 {
            seen.insert(key.hash_key(SEED));
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn high_and_low_bits_are_mixed() {
        // Sequential keys must spread over both the top four bits (tags) and
        // the low bits (slots).
        let mut top = HashSet::new();
        let mut low = HashSet::new();
        for key in 0..1_000_u32 {
            let h = key.hash_key(SEED);
            top.insert(h >> 60);
            low.insert(h & 0xff);
        }
        assert_eq!(top.len(), 16);
        assert!(low.len() > 200);
    }

    #[test]
    fn byte_arrays_depend_on_every_byte() {
        let a = *b"ABCDEFGHIJ";
        let mut b = a;
        b[9] = b'X';
        assert_ne!(a.hash_key(SEED), b.hash_key(SEED));
    }

    #[test]
    fn equal_floats_hash_equal() {
        assert_eq!((-0.0_f64).hash_key(SEED), 0.0_f64.hash_key(SEED));
        assert_ne!(1.0_f64.hash_key(SEED), (-1.0_f64).hash_key(SEED));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = 1_i32.hash_key(SEED);
        let b = 2_i32.hash_key(SEED);
        assert_ne!(hash_combine(a, b), hash_combine(b, a));
    }
}

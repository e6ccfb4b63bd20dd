//! Typed building blocks for [`Expression`](super::Expression) and
//! [`Aggregates`](super::Aggregates).
//!
//! Every constructor captures its input and output vectors and returns a
//! boxed closure over the batch size. `*_sel` variants read their inputs
//! through a selection vector and write compact outputs (`out[k]` belongs to
//! row `sel[k]`), except selections, which emit positions of the underlying
//! buffers.
//!
//! Entry primitives read and write payload fields at fixed byte offsets of
//! hash table entries. Their entry vectors must only ever hold live entries
//! laid out by the owning operator, hence they are crate-private.

use crate::hash::{HashKey, SEED, hash_combine};
use crate::hashmap::{Entry, EntryPtr};
use crate::vector::{ColumnType, Input, Numeric, Pos, Vector};

use super::{AggregatePrimitive, Primitive};

/// Folds a value into an accumulator.
pub type Fold<T> = fn(T, T) -> T;

pub fn fold_sum<T: Numeric>(acc: T, v: T) -> T {
    acc + v
}

pub fn fold_min<T: Numeric>(acc: T, v: T) -> T {
    if v < acc { v } else { acc }
}

pub fn fold_max<T: Numeric>(acc: T, v: T) -> T {
    if v > acc { v } else { acc }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    #[inline(always)]
    pub fn apply<T: PartialOrd>(self, a: &T, b: &T) -> bool {
        match self {
            Cmp::Eq => a == b,
            Cmp::Ne => a != b,
            Cmp::Lt => a < b,
            Cmp::Le => a <= b,
            Cmp::Gt => a > b,
            Cmp::Ge => a >= b,
        }
    }
}

// Selection

/// Positions `i < n` where `input[i] cmp constant`.
pub fn sel_cmp<T>(input: impl Input<T> + 'static, cmp: Cmp, constant: T, out: Vector<Pos>) -> Primitive
where
    T: ColumnType + PartialOrd,
{
    Box::new(move |n| {
        input.with(|values| {
            let mut out = out.borrow_mut();
            let mut found = 0;
            for (i, v) in values[..n].iter().enumerate() {
                out[found] = i as Pos;
                found += cmp.apply(v, &constant) as usize;
            }
            found
        })
    })
}

/// Positions `sel[k]` where `input[sel[k]] cmp constant`.
pub fn sel_cmp_sel<T>(
    sel: Vector<Pos>,
    input: impl Input<T> + 'static,
    cmp: Cmp,
    constant: T,
    out: Vector<Pos>,
) -> Primitive
where
    T: ColumnType + PartialOrd,
{
    Box::new(move |n| {
        input.with(|values| {
            let sel = sel.borrow();
            let mut out = out.borrow_mut();
            let mut found = 0;
            for &i in &sel[..n] {
                out[found] = i;
                found += cmp.apply(&values[i as usize], &constant) as usize;
            }
            found
        })
    })
}

/// Positions `i < n` where `a[i] cmp b[i]`.
pub fn sel_cmp_col<T>(
    a: impl Input<T> + 'static,
    cmp: Cmp,
    b: impl Input<T> + 'static,
    out: Vector<Pos>,
) -> Primitive
where
    T: ColumnType + PartialOrd,
{
    Box::new(move |n| {
        a.with(|a| {
            b.with(|b| {
                let mut out = out.borrow_mut();
                let mut found = 0;
                for i in 0..n {
                    out[found] = i as Pos;
                    found += cmp.apply(&a[i], &b[i]) as usize;
                }
                found
            })
        })
    })
}

// Projection

pub fn map<A, R>(
    input: impl Input<A> + 'static,
    out: Vector<R>,
    f: impl Fn(A) -> R + 'static,
) -> Primitive
where
    A: Copy + 'static,
    R: Copy + 'static,
{
    Box::new(move |n| {
        input.with(|values| {
            let mut out = out.borrow_mut();
            for (o, &v) in out[..n].iter_mut().zip(&values[..n]) {
                *o = f(v);
            }
        });
        n
    })
}

pub fn map2<A, B, R>(
    a: impl Input<A> + 'static,
    b: impl Input<B> + 'static,
    out: Vector<R>,
    f: impl Fn(A, B) -> R + 'static,
) -> Primitive
where
    A: Copy + 'static,
    B: Copy + 'static,
    R: Copy + 'static,
{
    Box::new(move |n| {
        a.with(|a| {
            b.with(|b| {
                let mut out = out.borrow_mut();
                for i in 0..n {
                    out[i] = f(a[i], b[i]);
                }
            })
        });
        n
    })
}

pub fn map_sel<A, R>(
    sel: Vector<Pos>,
    input: impl Input<A> + 'static,
    out: Vector<R>,
    f: impl Fn(A) -> R + 'static,
) -> Primitive
where
    A: Copy + 'static,
    R: Copy + 'static,
{
    Box::new(move |n| {
        input.with(|values| {
            let sel = sel.borrow();
            let mut out = out.borrow_mut();
            for (o, &i) in out[..n].iter_mut().zip(&sel[..n]) {
                *o = f(values[i as usize]);
            }
        });
        n
    })
}

pub fn map2_sel<A, B, R>(
    sel: Vector<Pos>,
    a: impl Input<A> + 'static,
    b: impl Input<B> + 'static,
    out: Vector<R>,
    f: impl Fn(A, B) -> R + 'static,
) -> Primitive
where
    A: Copy + 'static,
    B: Copy + 'static,
    R: Copy + 'static,
{
    Box::new(move |n| {
        a.with(|a| {
            b.with(|b| {
                let sel = sel.borrow();
                let mut out = out.borrow_mut();
                for k in 0..n {
                    let i = sel[k] as usize;
                    out[k] = f(a[i], b[i]);
                }
            })
        });
        n
    })
}

/// Compacts `input` through `sel`: `out[k] = input[sel[k]]`.
pub fn gather_sel<T: Copy + 'static>(
    sel: Vector<Pos>,
    input: impl Input<T> + 'static,
    out: Vector<T>,
) -> Primitive {
    map_sel(sel, input, out, |v| v)
}

// Hashing

pub fn hash<T: ColumnType>(input: impl Input<T> + 'static, out: Vector<u64>) -> Primitive {
    Box::new(move |n| {
        input.with(|values| {
            let mut out = out.borrow_mut();
            for (h, v) in out[..n].iter_mut().zip(&values[..n]) {
                *h = v.hash_key(SEED);
            }
        });
        n
    })
}

pub fn hash_sel<T: ColumnType>(
    sel: Vector<Pos>,
    input: impl Input<T> + 'static,
    out: Vector<u64>,
) -> Primitive {
    Box::new(move |n| {
        input.with(|values| {
            let sel = sel.borrow();
            let mut out = out.borrow_mut();
            for (h, &i) in out[..n].iter_mut().zip(&sel[..n]) {
                *h = values[i as usize].hash_key(SEED);
            }
        });
        n
    })
}

/// Folds another key column into `hashes`.
pub fn rehash<T: ColumnType>(input: impl Input<T> + 'static, hashes: Vector<u64>) -> Primitive {
    Box::new(move |n| {
        input.with(|values| {
            let mut hashes = hashes.borrow_mut();
            for (h, v) in hashes[..n].iter_mut().zip(&values[..n]) {
                *h = hash_combine(*h, v.hash_key(SEED));
            }
        });
        n
    })
}

pub fn rehash_sel<T: ColumnType>(
    sel: Vector<Pos>,
    input: impl Input<T> + 'static,
    hashes: Vector<u64>,
) -> Primitive {
    Box::new(move |n| {
        input.with(|values| {
            let sel = sel.borrow();
            let mut hashes = hashes.borrow_mut();
            for (h, &i) in hashes[..n].iter_mut().zip(&sel[..n]) {
                *h = hash_combine(*h, values[i as usize].hash_key(SEED));
            }
        });
        n
    })
}

// Entries

/// `entries[k].field(offset) = input[k]`.
pub(crate) fn scatter<T: ColumnType>(
    input: impl Input<T> + 'static,
    entries: Vector<EntryPtr>,
    offset: usize,
) -> Primitive {
    Box::new(move |n| {
        input.with(|values| {
            let entries = entries.borrow();
            for (&e, &v) in entries[..n].iter().zip(&values[..n]) {
                // SAFETY: entries are live and laid out with a `T` at `offset`.
                unsafe { Entry::field::<T>(e, offset).write(v) };
            }
        });
        n
    })
}

/// `entries[k].field(offset) = input[sel[k]]`.
pub(crate) fn scatter_sel<T: ColumnType>(
    sel: Vector<Pos>,
    input: impl Input<T> + 'static,
    entries: Vector<EntryPtr>,
    offset: usize,
) -> Primitive {
    Box::new(move |n| {
        input.with(|values| {
            let sel = sel.borrow();
            let entries = entries.borrow();
            for (&e, &i) in entries[..n].iter().zip(&sel[..n]) {
                // SAFETY: as in `scatter`.
                unsafe { Entry::field::<T>(e, offset).write(values[i as usize]) };
            }
        });
        n
    })
}

/// Keeps the `(entries[k], rows[k])` pairs whose entry field at `offset`
/// equals `input[rows[k]]`, compacting both vectors in place.
pub(crate) fn keys_equal<T: ColumnType>(
    entries: Vector<EntryPtr>,
    rows: Vector<Pos>,
    input: impl Input<T> + 'static,
    offset: usize,
) -> Primitive {
    Box::new(move |n| {
        input.with(|values| {
            let mut entries = entries.borrow_mut();
            let mut rows = rows.borrow_mut();
            let mut found = 0;
            for k in 0..n {
                let e = entries[k];
                let row = rows[k];
                // SAFETY: as in `scatter`.
                let key = unsafe { Entry::field::<T>(e, offset).read() };
                entries[found] = e;
                rows[found] = row;
                found += (key == values[row as usize]) as usize;
            }
            found
        })
    })
}

/// `out[k] = entries[k].field(offset)`.
pub(crate) fn gather_entry<T: ColumnType>(
    entries: Vector<EntryPtr>,
    offset: usize,
    out: Vector<T>,
) -> Primitive {
    Box::new(move |n| {
        let entries = entries.borrow();
        let mut out = out.borrow_mut();
        for (o, &e) in out[..n].iter_mut().zip(&entries[..n]) {
            // SAFETY: as in `scatter`.
            *o = unsafe { Entry::field::<T>(e, offset).read() };
        }
        n
    })
}

/// Sets the field at `offset` of fresh entries to `value`.
pub(crate) fn init_entry<T: ColumnType>(
    entries: Vector<EntryPtr>,
    offset: usize,
    value: T,
) -> Primitive {
    Box::new(move |n| {
        let entries = entries.borrow();
        for &e in &entries[..n] {
            // SAFETY: as in `scatter`.
            unsafe { Entry::field::<T>(e, offset).write(value) };
        }
        n
    })
}

/// Folds `input[k]` into the accumulator of `groups[k]`.
pub(crate) fn agg_entry<T: Numeric>(
    groups: Vector<EntryPtr>,
    input: impl Input<T> + 'static,
    offset: usize,
    fold: Fold<T>,
) -> AggregatePrimitive {
    Box::new(move |n| {
        input.with(|values| {
            let groups = groups.borrow();
            for (&g, &v) in groups[..n].iter().zip(&values[..n]) {
                // SAFETY: as in `scatter`.
                unsafe {
                    let acc = Entry::field::<T>(g, offset);
                    acc.write(fold(acc.read(), v));
                }
            }
        })
    })
}

pub(crate) fn agg_entry_count(groups: Vector<EntryPtr>, offset: usize) -> AggregatePrimitive {
    Box::new(move |n| {
        let groups = groups.borrow();
        for &g in &groups[..n] {
            // SAFETY: as in `scatter`.
            unsafe { *Entry::field::<i64>(g, offset) += 1 };
        }
    })
}

/// Merges the accumulator of `src` into `dst`.
pub(crate) type Combine = Box<dyn Fn(EntryPtr, EntryPtr)>;

pub(crate) fn combine_entry<T: Numeric>(offset: usize, fold: Fold<T>) -> Combine {
    Box::new(move |dst, src| {
        // SAFETY: both entries share the layout with a `T` at `offset`.
        unsafe {
            let acc = Entry::field::<T>(dst, offset);
            acc.write(fold(acc.read(), Entry::field::<T>(src, offset).read()));
        }
    })
}

/// Compares the key field at `offset` of two entries.
pub(crate) type EntriesEqual = Box<dyn Fn(EntryPtr, EntryPtr) -> bool>;

pub(crate) fn entries_equal<T: ColumnType>(offset: usize) -> EntriesEqual {
    Box::new(move |a, b| {
        // SAFETY: as in `combine_entry`.
        unsafe { Entry::field::<T>(a, offset).read() == Entry::field::<T>(b, offset).read() }
    })
}

// Single-row aggregates

/// Folds `input[..n]` into `out[0]`.
pub fn agg_static<T: Numeric>(
    input: impl Input<T> + 'static,
    out: Vector<T>,
    fold: Fold<T>,
) -> AggregatePrimitive {
    Box::new(move |n| {
        input.with(|values| {
            let mut out = out.borrow_mut();
            out[0] = values[..n].iter().fold(out[0], |acc, &v| fold(acc, v));
        })
    })
}

/// Folds `input[sel[..n]]` into `out[0]`.
pub fn agg_static_sel<T: Numeric>(
    sel: Vector<Pos>,
    input: impl Input<T> + 'static,
    out: Vector<T>,
    fold: Fold<T>,
) -> AggregatePrimitive {
    Box::new(move |n| {
        input.with(|values| {
            let sel = sel.borrow();
            let mut out = out.borrow_mut();
            out[0] = sel[..n]
                .iter()
                .fold(out[0], |acc, &i| fold(acc, values[i as usize]));
        })
    })
}

pub fn agg_static_count(out: Vector<i64>) -> AggregatePrimitive {
    Box::new(move |n| out.borrow_mut()[0] += n as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{Allocator, GlobalPool};

    fn positions(v: &Vector<Pos>, n: usize) -> Vec<Pos> {
        v.head(n)
    }

    #[test]
    fn selections() {
        let input = Vector::from_vec(vec![5_i32, 1, 7, 3, 9, 2]);
        let out = Vector::filled(6, 0);
        let mut lt = sel_cmp(input.clone(), Cmp::Lt, 5, out.clone());
        assert_eq!(lt(6), 3);
        assert_eq!(positions(&out, 3), vec![1, 3, 5]);

        let out2 = Vector::filled(6, 0);
        let mut ge = sel_cmp_sel(out.clone(), input.clone(), Cmp::Ge, 2, out2.clone());
        assert_eq!(ge(3), 2);
        assert_eq!(positions(&out2, 2), vec![3, 5]);

        let other = Vector::from_vec(vec![5_i32, 0, 8, 3, 1, 2]);
        let mut eq = sel_cmp_col(input, Cmp::Eq, other, out.clone());
        assert_eq!(eq(6), 3);
        assert_eq!(positions(&out, 3), vec![0, 3, 5]);
    }

    #[test]
    fn maps_and_gathers() {
        let price = Vector::from_vec(vec![10.0_f64, 20.0, 30.0]);
        let discount = Vector::from_vec(vec![0.1_f64, 0.0, 0.5]);
        let out = Vector::filled(3, 0.0);
        let mut revenue = map2(price.clone(), discount, out.clone(), |p, d| p * (1.0 - d));
        assert_eq!(revenue(3), 3);
        assert_eq!(out.head(3), vec![9.0, 20.0, 15.0]);

        let sel = Vector::from_vec(vec![2_u32, 0]);
        let gathered = Vector::filled(3, 0.0);
        let mut g = gather_sel(sel, price, gathered.clone());
        g(2);
        assert_eq!(gathered.head(2), vec![30.0, 10.0]);
    }

    #[test]
    fn hash_sel_matches_hash_of_gathered_values() {
        let keys = Vector::from_vec(vec![3_i64, 4, 5, 6]);
        let sel = Vector::from_vec(vec![3_u32, 1]);
        let selected = Vector::filled(4, 0);
        hash_sel(sel, keys, selected.clone())(2);
        let compact = Vector::from_vec(vec![6_i64, 4]);
        let direct = Vector::filled(2, 0);
        hash(compact.clone(), direct.clone())(2);
        assert_eq!(selected.head(2), direct.head(2));

        let second = Vector::from_vec(vec![1_i32, 2]);
        rehash(second, direct.clone())(2);
        assert_ne!(selected.head(2), direct.head(2));
    }

    #[test]
    fn scatter_compare_gather_roundtrip() {
        const SIZE: usize = Entry::HEADER + 16;
        let pool = GlobalPool::new(1 << 16).unwrap();
        let mut alloc = Allocator::new(pool);
        let entries = Vector::filled(4, std::ptr::null_mut());
        for e in entries.borrow_mut().iter_mut() {
            *e = alloc.allocate(SIZE).unwrap().as_ptr().cast();
        }
        let keys = Vector::from_vec(vec![1_i64, 2, 3, 4]);
        let values = Vector::from_vec(vec![10_i32, 20, 30, 40]);
        scatter(keys, entries.clone(), Entry::HEADER)(4);
        scatter(values, entries.clone(), Entry::HEADER + 8)(4);

        // Probe rows 0..4 against the entries, keys match on rows 0 and 2.
        let probe = Vector::from_vec(vec![1_i64, 9, 3, 8]);
        let rows = Vector::from_vec(vec![0_u32, 1, 2, 3]);
        let found = keys_equal(entries.clone(), rows.clone(), probe, Entry::HEADER)(4);
        assert_eq!(found, 2);
        assert_eq!(rows.head(2), vec![0, 2]);

        let out = Vector::filled(4, 0_i32);
        gather_entry(entries, Entry::HEADER + 8, out.clone())(found);
        assert_eq!(out.head(2), vec![10, 30]);
    }

    #[test]
    fn entry_aggregates() {
        const SIZE: usize = Entry::HEADER + 16;
        let pool = GlobalPool::new(1 << 16).unwrap();
        let mut alloc = Allocator::new(pool);
        let a: EntryPtr = alloc.allocate(SIZE).unwrap().as_ptr().cast();
        let b: EntryPtr = alloc.allocate(SIZE).unwrap().as_ptr().cast();
        let groups = Vector::from_vec(vec![a, b, a]);
        init_entry(groups.clone(), Entry::HEADER, i64::MAX)(2);
        init_entry(groups.clone(), Entry::HEADER + 8, 0_i64)(2);

        let input = Vector::from_vec(vec![7_i64, 3, 5]);
        agg_entry(groups.clone(), input, Entry::HEADER, fold_min)(3);
        agg_entry_count(groups, Entry::HEADER + 8)(3);
        unsafe {
            assert_eq!(*Entry::field::<i64>(a, Entry::HEADER), 5);
            assert_eq!(*Entry::field::<i64>(a, Entry::HEADER + 8), 2);
        }
        combine_entry::<i64>(Entry::HEADER, fold_min)(a, b);
        combine_entry::<i64>(Entry::HEADER + 8, fold_sum)(a, b);
        unsafe {
            assert_eq!(*Entry::field::<i64>(a, Entry::HEADER), 3);
            assert_eq!(*Entry::field::<i64>(a, Entry::HEADER + 8), 3);
        }
    }

    #[test]
    fn static_aggregates() {
        let input = Vector::from_vec(vec![4_i64, -2, 9]);
        let sum = Vector::filled(1, 0_i64);
        let max = Vector::filled(1, i64::MIN);
        let count = Vector::filled(1, 0_i64);
        agg_static(input.clone(), sum.clone(), fold_sum)(3);
        agg_static(input, max.clone(), fold_max)(2);
        agg_static_count(count.clone())(3);
        assert_eq!(sum.head(1), vec![11]);
        assert_eq!(max.head(1), vec![4]);
        assert_eq!(count.head(1), vec![3]);

        let sel = Vector::from_vec(vec![0_u32, 2]);
        let selected = Vector::filled(1, 0_i64);
        agg_static_sel(sel, Vector::from_vec(vec![4_i64, -2, 9]), selected.clone(), fold_sum)(2);
        assert_eq!(selected.head(1), vec![13]);
    }

    #[test]
    fn entries_compare_by_typed_key() {
        const SIZE: usize = Entry::HEADER + 8;
        let pool = GlobalPool::new(1 << 16).unwrap();
        let mut alloc = Allocator::new(pool);
        let entries = Vector::filled(3, std::ptr::null_mut());
        for e in entries.borrow_mut().iter_mut() {
            *e = alloc.allocate(SIZE).unwrap().as_ptr().cast();
        }
        scatter(Vector::from_vec(vec![0.0_f64, -0.0, 1.5]), entries.clone(), Entry::HEADER)(3);
        let e = entries.head(3);
        let eq = entries_equal::<f64>(Entry::HEADER);
        // Signed zeros differ in their bytes but are the same key.
        assert!(eq(e[0], e[1]));
        assert!(!eq(e[0], e[2]));
    }
}

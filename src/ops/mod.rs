//! Vectorized pull operators.
//!
//! ```text
//!   ResultWriter ◄── HashGroup ◄── Project ◄── Hashjoin ◄─┬── Select ◄── Scan (probe)
//!                                                         └── Scan (build)
//! ```
//!
//! [`Operator::next`] returns how many rows of the shared scratch vectors are
//! valid, at most the configured vector size; 0 means the stream is exhausted
//! and every later call returns 0 as well.

pub mod fixed_aggr;
pub mod hash_group;
pub mod hash_join;
pub mod primitives;
pub mod result_writer;
pub mod scan;
pub mod select;

pub use fixed_aggr::FixedAggr;
pub use hash_group::{HashGroup, HashGroupBuilder};
pub use hash_join::{Hashjoin, HashjoinBuilder, JoinInput};
pub use result_writer::ResultWriter;
pub use scan::Scan;
pub use select::{Project, Select};

use crate::error::Result;

pub trait Operator {
    fn next(&mut self) -> Result<usize>;
}

impl<O: Operator + ?Sized> Operator for Box<O> {
    fn next(&mut self) -> Result<usize> {
        (**self).next()
    }
}

/// One step of an [`Expression`]: maps a row count to the number of rows
/// that survive it.
pub type Primitive = Box<dyn FnMut(usize) -> usize>;

/// One step of an [`Aggregates`] pipeline.
pub type AggregatePrimitive = Box<dyn FnMut(usize)>;

/// An ordered list of primitives evaluated over the same batch.
#[derive(Default)]
pub struct Expression {
    ops: Vec<Primitive>,
}

impl Expression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: Primitive) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Runs the primitives in order. Stops early once a step leaves no rows.
    pub fn evaluate(&mut self, mut n: usize) -> usize {
        for op in &mut self.ops {
            if n == 0 {
                break;
            }
            n = op(n);
        }
        n
    }
}

#[derive(Default)]
pub struct Aggregates {
    ops: Vec<AggregatePrimitive>,
}

impl Aggregates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: AggregatePrimitive) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn update(&mut self, n: usize) {
        for op in &mut self.ops {
            op(n);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the operator tests.

    use super::*;
    use crate::vector::{Input, Vector};

    /// Emits a fixed list of batches, then 0 forever.
    pub struct Batches<T> {
        batches: Vec<Vec<T>>,
        out: Vector<T>,
        next: usize,
    }

    impl<T: Copy + Default> Batches<T> {
        pub fn new(batches: Vec<Vec<T>>) -> Self {
            let width = batches.iter().map(Vec::len).max().unwrap_or(0).max(1);
            Self {
                batches,
                out: Vector::filled(width, T::default()),
                next: 0,
            }
        }

        pub fn output(&self) -> Vector<T> {
            self.out.clone()
        }
    }

    impl<T: Copy> Operator for Batches<T> {
        fn next(&mut self) -> Result<usize> {
            let Some(batch) = self.batches.get(self.next) else {
                return Ok(0);
            };
            self.next += 1;
            self.out.borrow_mut()[..batch.len()].copy_from_slice(batch);
            Ok(batch.len())
        }
    }

    /// Pulls `op` to exhaustion and returns the batch sizes, none of which
    /// may exceed `vector_size`.
    pub fn drain(op: &mut dyn Operator, vector_size: usize) -> Vec<usize> {
        let mut sizes = Vec::new();
        loop {
            let n = op.next().unwrap();
            assert!(n <= vector_size, "batch of {n} rows exceeds {vector_size}");
            if n == 0 {
                // Exhaustion is sticky.
                assert_eq!(op.next().unwrap(), 0);
                return sizes;
            }
            sizes.push(n);
        }
    }

    pub fn read<T: Copy>(input: &impl Input<T>, n: usize) -> Vec<T> {
        input.with(|v| v[..n].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn expression_stops_at_empty_selection() {
        let calls = Rc::new(Cell::new(0));
        let mut expr = Expression::new();
        let c = calls.clone();
        expr.add(Box::new(move |n| {
            c.set(c.get() + 1);
            n / 2
        }));
        let c = calls.clone();
        expr.add(Box::new(move |n| {
            c.set(c.get() + 1);
            n - 1
        }));
        assert_eq!(expr.evaluate(10), 4);
        assert_eq!(calls.get(), 2);
        // 1 / 2 == 0, second step never runs.
        assert_eq!(expr.evaluate(1), 0);
        assert_eq!(calls.get(), 3);
    }
}

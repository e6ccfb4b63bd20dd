use crate::error::Result;
use crate::vector::{Input, Numeric, Pos, Vector};

use super::primitives::{
    Fold, agg_static, agg_static_count, agg_static_sel, fold_max, fold_min, fold_sum,
};
use super::{Aggregates, Operator};

/// Aggregates its whole input into a single row without grouping.
///
/// Every worker folds the rows it pulled, so a query run by `n` workers
/// produces `n` partial rows that the caller folds once more.
pub struct FixedAggr {
    child: Box<dyn Operator>,
    aggregates: Aggregates,
    selection: Option<Vector<Pos>>,
    done: bool,
}

impl FixedAggr {
    pub fn new(child: Box<dyn Operator>) -> Self {
        Self {
            child,
            aggregates: Aggregates::new(),
            selection: None,
            done: false,
        }
    }

    /// Aggregates only the rows of `sel`, the output of a
    /// [`Select`](super::Select) below this operator.
    pub fn with_selection(child: Box<dyn Operator>, sel: Vector<Pos>) -> Self {
        Self {
            selection: Some(sel),
            ..Self::new(child)
        }
    }

    fn fold<T: Numeric>(&mut self, input: impl Input<T> + 'static, init: T, fold: Fold<T>) -> Vector<T> {
        let out = Vector::filled(1, init);
        let op = match &self.selection {
            Some(sel) => agg_static_sel(sel.clone(), input, out.clone(), fold),
            None => agg_static(input, out.clone(), fold),
        };
        self.aggregates.add(op);
        out
    }

    pub fn sum<T: Numeric>(&mut self, input: impl Input<T> + 'static) -> Vector<T> {
        self.fold(input, T::ZERO, fold_sum)
    }

    pub fn min<T: Numeric>(&mut self, input: impl Input<T> + 'static) -> Vector<T> {
        self.fold(input, T::MAX, fold_min)
    }

    pub fn max<T: Numeric>(&mut self, input: impl Input<T> + 'static) -> Vector<T> {
        self.fold(input, T::MIN, fold_max)
    }

    pub fn count(&mut self) -> Vector<i64> {
        let out = Vector::filled(1, 0);
        self.aggregates.add(agg_static_count(out.clone()));
        out
    }
}

impl Operator for FixedAggr {
    fn next(&mut self) -> Result<usize> {
        if self.done {
            return Ok(0);
        }
        loop {
            let n = self.child.next()?;
            if n == 0 {
                break;
            }
            self.aggregates.update(n);
        }
        self.done = true;
        Ok(1)
    }
}

use crate::error::Result;

use super::{Expression, Operator};

/// Pulls batches until its predicate expression selects at least one row.
pub struct Select {
    child: Box<dyn Operator>,
    predicate: Expression,
}

impl Select {
    pub fn new(child: Box<dyn Operator>, predicate: Expression) -> Self {
        Self { child, predicate }
    }
}

impl Operator for Select {
    fn next(&mut self) -> Result<usize> {
        loop {
            let n = self.child.next()?;
            if n == 0 {
                return Ok(0);
            }
            let found = self.predicate.evaluate(n);
            if found > 0 {
                return Ok(found);
            }
        }
    }
}

/// Computes derived columns for every non-empty batch.
pub struct Project {
    child: Box<dyn Operator>,
    expression: Expression,
}

impl Project {
    pub fn new(child: Box<dyn Operator>, expression: Expression) -> Self {
        Self { child, expression }
    }
}

impl Operator for Project {
    fn next(&mut self) -> Result<usize> {
        let n = self.child.next()?;
        if n > 0 {
            self.expression.evaluate(n);
        }
        Ok(n)
    }
}

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::storage::Relation;
use crate::vector::{ColumnType, ColumnView};
use crate::worker::WorkerContext;

use super::Operator;

/// Progress through a relation, common to every worker scanning it.
#[derive(Default)]
pub struct ScanShared {
    cursor: AtomicUsize,
}

/// Hands out a relation in vector-sized slices of morsels claimed from a
/// shared cursor, so that the workers split it dynamically.
pub struct Scan {
    shared: Arc<ScanShared>,
    relation: Arc<Relation>,
    morsel_size: usize,
    vector_size: usize,
    position: Rc<Cell<usize>>,
    len: usize,
    morsel_end: usize,
    exhausted: bool,
}

impl Scan {
    pub fn new(ctx: &mut WorkerContext, relation: Arc<Relation>) -> Result<Self> {
        Ok(Self {
            shared: ctx.shared()?,
            relation,
            morsel_size: ctx.config().morsel_size,
            vector_size: ctx.vector_size(),
            position: Rc::new(Cell::new(0)),
            len: 0,
            morsel_end: 0,
            exhausted: false,
        })
    }

    /// A view of column `name` that follows this scan.
    pub fn column<T: ColumnType>(&self, name: &str) -> Result<ColumnView<T>> {
        Ok(ColumnView::new(
            self.relation.column::<T>(name)?,
            Rc::clone(&self.position),
        ))
    }
}

impl Operator for Scan {
    fn next(&mut self) -> Result<usize> {
        if self.exhausted {
            return Ok(0);
        }
        let rows = self.relation.rows();
        let mut start = self.position.get() + self.len;
        if start >= self.morsel_end {
            start = self.shared.cursor.fetch_add(self.morsel_size, Ordering::Relaxed);
            if start >= rows {
                self.exhausted = true;
                self.len = 0;
                return Ok(0);
            }
            self.morsel_end = (start + self.morsel_size).min(rows);
        }
        self.len = self.vector_size.min(self.morsel_end - start);
        self.position.set(start);
        Ok(self.len)
    }
}

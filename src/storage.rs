//! Minimal base and result storage consumed by the operators.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ExecError, Result};
use crate::vector::ColumnType;

type Column = Arc<dyn Any + Send + Sync>;

/// Immutable, column-oriented base relation.
#[derive(Default)]
pub struct Relation {
    rows: usize,
    columns: HashMap<String, Column>,
}

impl Relation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column. Every column must have the same length.
    pub fn add_column<T: ColumnType>(&mut self, name: &str, values: Vec<T>) -> Result<&mut Self> {
        if !self.columns.is_empty() && values.len() != self.rows {
            return Err(ExecError::ContractViolation(format!(
                "column {name} has {} rows, relation has {}",
                values.len(),
                self.rows
            )));
        }
        self.rows = values.len();
        self.columns.insert(name.to_string(), Arc::new(values));
        Ok(self)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn column<T: ColumnType>(&self, name: &str) -> Result<Arc<Vec<T>>> {
        let column = self
            .columns
            .get(name)
            .ok_or_else(|| ExecError::UnknownColumn(name.to_string()))?;
        Arc::clone(column)
            .downcast::<Vec<T>>()
            .map_err(|_| ExecError::TypeMismatch {
                column: name.to_string(),
                expected: type_name::<T>(),
            })
    }
}

struct Attribute {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    make: fn(usize) -> Box<dyn Any + Send>,
}

fn make_column<T: ColumnType>(capacity: usize) -> Box<dyn Any + Send> {
    Box::new(vec![T::default(); capacity])
}

/// A fixed-capacity slab of result rows.
pub struct Block {
    columns: Vec<Box<dyn Any + Send>>,
    capacity: usize,
    len: usize,
}

impl Block {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free(&self) -> usize {
        self.capacity - self.len
    }

    /// Full storage of attribute `attr`; the first [`len`](Self::len) values
    /// are filled.
    pub fn data<T: ColumnType>(&mut self, attr: usize) -> Result<&mut [T]> {
        let column = self
            .columns
            .get_mut(attr)
            .ok_or_else(|| ExecError::UnknownColumn(format!("attribute #{attr}")))?;
        column
            .downcast_mut::<Vec<T>>()
            .map(|v| v.as_mut_slice())
            .ok_or_else(|| ExecError::TypeMismatch {
                column: format!("attribute #{attr}"),
                expected: type_name::<T>(),
            })
    }

    /// Commits `n` values written past the current end of every attribute.
    pub fn added_elements(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.capacity);
        self.len += n;
    }
}

/// Append-only result relation made of [`Block`]s. Blocks are created under
/// a lock; each block has a single writer.
#[derive(Default)]
pub struct BlockRelation {
    attributes: Mutex<Vec<Attribute>>,
    blocks: Mutex<Vec<Arc<Mutex<Block>>>>,
}

impl BlockRelation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an attribute and returns its index. Must happen before the
    /// first block is created.
    pub fn add_attribute<T: ColumnType>(&self, name: &str) -> Result<usize> {
        if !self.blocks.lock().is_empty() {
            return Err(ExecError::ContractViolation(format!(
                "attribute {name} added after blocks were created"
            )));
        }
        let mut attributes = self.attributes.lock();
        attributes.push(Attribute {
            name: name.to_string(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            make: make_column::<T>,
        });
        Ok(attributes.len() - 1)
    }

    /// Index of attribute `name`, checked against `T`.
    pub fn attribute<T: ColumnType>(&self, name: &str) -> Result<usize> {
        let attributes = self.attributes.lock();
        let (index, attribute) = attributes
            .iter()
            .enumerate()
            .find(|(_, a)| a.name == name)
            .ok_or_else(|| ExecError::UnknownColumn(name.to_string()))?;
        if attribute.type_id != TypeId::of::<T>() {
            return Err(ExecError::TypeMismatch {
                column: name.to_string(),
                expected: attribute.type_name,
            });
        }
        Ok(index)
    }

    pub fn create_block(&self, min_size: usize) -> Arc<Mutex<Block>> {
        let attributes = self.attributes.lock();
        let block = Arc::new(Mutex::new(Block {
            columns: attributes.iter().map(|a| (a.make)(min_size)).collect(),
            capacity: min_size,
            len: 0,
        }));
        self.blocks.lock().push(Arc::clone(&block));
        block
    }

    /// Total number of committed rows.
    pub fn len(&self) -> usize {
        self.blocks.lock().iter().map(|b| b.lock().len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed values of attribute `name` across all blocks.
    pub fn collect<T: ColumnType>(&self, name: &str) -> Result<Vec<T>> {
        let attr = self.attribute::<T>(name)?;
        let mut values = Vec::new();
        for block in self.blocks.lock().iter() {
            let mut block = block.lock();
            let len = block.len;
            values.extend_from_slice(&block.data::<T>(attr)?[..len]);
        }
        Ok(values)
    }
}

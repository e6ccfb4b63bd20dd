use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Block, BlockRelation};
use crate::vector::{ColumnType, Input};
use crate::worker::WorkerContext;

use super::Operator;

type ColumnWriter = Box<dyn FnMut(&mut Block, usize) -> Result<()>>;

/// Pipeline terminus: appends every batch to a [`BlockRelation`].
pub struct ResultWriter {
    child: Box<dyn Operator>,
    relation: Arc<BlockRelation>,
    block_size: usize,
    block: Option<Arc<Mutex<Block>>>,
    writers: Vec<ColumnWriter>,
}

impl ResultWriter {
    pub fn new(ctx: &WorkerContext, child: Box<dyn Operator>, relation: Arc<BlockRelation>) -> Self {
        Self {
            child,
            relation,
            block_size: ctx.config().block_size.max(ctx.vector_size()),
            block: None,
            writers: Vec::new(),
        }
    }

    /// Writes `input` to attribute `name`. The first worker to get here
    /// registers the attribute.
    pub fn column<T: ColumnType>(
        &mut self,
        ctx: &mut WorkerContext,
        name: &str,
        input: impl Input<T> + 'static,
    ) -> Result<()> {
        let relation = Arc::clone(&self.relation);
        ctx.once(|| relation.add_attribute::<T>(name).map(|_| ()))?;
        let attr = self.relation.attribute::<T>(name)?;
        self.writers.push(Box::new(move |block, n| {
            let start = block.len();
            let data = block.data::<T>(attr)?;
            input.with(|values| data[start..start + n].copy_from_slice(&values[..n]));
            Ok(())
        }));
        Ok(())
    }
}

impl Operator for ResultWriter {
    fn next(&mut self) -> Result<usize> {
        let n = self.child.next()?;
        if n == 0 {
            return Ok(0);
        }
        let block = match &self.block {
            Some(block) if block.lock().free() >= n => Arc::clone(block),
            _ => {
                let block = self.relation.create_block(self.block_size);
                self.block = Some(Arc::clone(&block));
                block
            }
        };
        let mut block = block.lock();
        for write in &mut self.writers {
            write(&mut block, n)?;
        }
        block.added_elements(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use crate::ops::testing::Batches;
    use crate::worker::execute;

    #[test]
    fn batches_are_split_over_blocks() {
        let sink = Arc::new(BlockRelation::new());
        let config = ExecConfig::default()
            .with_threads(1)
            .with_vector_size(4)
            .with_morsel_size(4)
            .with_block_size(6);
        let rows = execute(&config, |ctx| {
            let child = Batches::new(vec![vec![1_i32, 2, 3], vec![4, 5, 6, 7], vec![8]]);
            let values = child.output();
            let mut writer = ResultWriter::new(ctx, Box::new(child), sink.clone());
            writer.column(ctx, "v", values.clone())?;
            writer.column(ctx, "copy", values)?;
            Ok(Box::new(writer))
        })
        .unwrap();
        assert_eq!(rows, 8);
        // 3 rows, then 4 do not fit into the 3 free slots, then 1 more.
        assert_eq!(sink.collect::<i32>("v").unwrap(), (1..=8).collect::<Vec<_>>());
        assert_eq!(sink.collect::<i32>("copy").unwrap().len(), 8);
    }
}

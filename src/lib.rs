//! Vectorized push/pull query execution over in-memory columns.
//!
//! A query runs on a fixed group of workers. Every worker builds its own copy
//! of the operator tree through a [`WorkerContext`]; operators that must
//! cooperate (scans, hash joins, hash groupings, result writers) find their
//! peers' state in a shared registry, numbered in build order, and meet at a
//! common barrier between phases.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vexec::ops::{Expression, FixedAggr, ResultWriter, Scan, Select};
//! use vexec::ops::primitives::{Cmp, sel_cmp};
//! use vexec::{BlockRelation, ExecConfig, Relation, execute};
//!
//! # fn main() -> vexec::Result<()> {
//! let mut orders = Relation::new();
//! orders.add_column("amount", vec![5_i64, 50, 500])?;
//! let orders = Arc::new(orders);
//! let sink = Arc::new(BlockRelation::new());
//!
//! execute(&ExecConfig::default(), |ctx| {
//!     let scan = Scan::new(ctx, orders.clone())?;
//!     let amount = scan.column::<i64>("amount")?;
//!     let sel = ctx.vectors().get();
//!     let mut predicate = Expression::new();
//!     predicate.add(sel_cmp(amount, Cmp::Gt, 10, sel));
//!     let mut count = FixedAggr::new(Box::new(Select::new(Box::new(scan), predicate)));
//!     let n = count.count();
//!     let mut writer = ResultWriter::new(ctx, Box::new(count), sink.clone());
//!     writer.column(ctx, "n", n)?;
//!     Ok(Box::new(writer))
//! })?;
//! let total: i64 = sink.collect::<i64>("n")?.iter().sum();
//! assert_eq!(total, 2);
//! # Ok(())
//! # }
//! ```

pub mod barrier;
pub mod config;
pub mod deque;
pub mod error;
pub mod hash;
pub mod hashmap;
pub mod mem;
pub mod ops;
pub mod small_map;
pub mod stack;
pub mod storage;
pub mod vector;
pub mod worker;

pub use config::{ExecConfig, JoinStrategy};
pub use error::{ExecError, Result};
pub use storage::{BlockRelation, Relation};
pub use vector::{ColumnType, Input, Numeric, Pos, Vector};
pub use worker::{WorkerContext, execute};

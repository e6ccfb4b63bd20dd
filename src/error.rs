//! Error type shared by every layer of the engine.
//!
//! Nothing in the execution core recovers from these. An error returned from
//! [`Operator::next`](crate::ops::Operator::next) ends the query on every
//! worker.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The global pool could not map another chunk.
    #[error("failed to map {size} bytes for the global pool")]
    Allocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),

    /// A synchronization or wiring contract was broken. This is a bug in the
    /// code assembling the operator tree, not a runtime condition.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("column {column} is not of type {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
    },

    /// A hash table entry payload cannot be laid out inline.
    #[error("unsupported entry layout: {0}")]
    Layout(String),

    /// Another worker of the same group failed; this worker gave up waiting.
    #[error("query aborted by a failing worker")]
    Aborted,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

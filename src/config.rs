//! Execution configuration.
//!
//! The engine does not parse command lines. Drivers resolve an [`ExecConfig`]
//! (optionally via [`ExecConfig::from_env`]) and hand it to
//! [`execute`](crate::worker::execute).

use std::env;
use std::fmt;
use std::str::FromStr;
use std::thread;

use thiserror::Error;

/// How the hash join walks hash chains while probing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum JoinStrategy {
    /// One probe row at a time, chain order preserved.
    Scalar,
    /// Head lookups decoupled from chain walks through a followup ring.
    #[default]
    Parallel,
    /// Like `Parallel`, but head lookups are done eight lanes at a time.
    Simd,
    /// Every chain head is queued unchecked and verified while draining.
    Boncz,
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Parallel => write!(f, "parallel"),
            Self::Simd => write!(f, "simd"),
            Self::Boncz => write!(f, "boncz"),
        }
    }
}

impl FromStr for JoinStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scalar" => Ok(Self::Scalar),
            "parallel" => Ok(Self::Parallel),
            "simd" => Ok(Self::Simd),
            "boncz" => Ok(Self::Boncz),
            _ => Err(ConfigError::InvalidJoinStrategy(s.to_string())),
        }
    }
}

/// Errors from [`ExecConfig::validate`] and [`ExecConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("vector size must be greater than zero")]
    ZeroVectorSize,
    #[error("thread count must be greater than zero")]
    ZeroThreads,
    #[error("morsel size must be greater than zero")]
    ZeroMorselSize,
    #[error("morsel size {morsel} is smaller than the vector size {vector}")]
    MorselSmallerThanVector { morsel: usize, vector: usize },
    #[error("group capacity must be greater than zero")]
    ZeroGroupCapacity,
    #[error("unknown join strategy: {0}")]
    InvalidJoinStrategy(String),
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

/// Resolved execution parameters for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    /// Maximum number of rows in one batch.
    pub vector_size: usize,
    /// Number of workers, the calling thread included.
    pub threads: usize,
    /// Rows claimed from a shared scan cursor at once.
    pub morsel_size: usize,
    pub join_strategy: JoinStrategy,
    /// Number of spill partitions used by hash grouping (power of two).
    pub spill_partitions: usize,
    /// Groups a worker pre-aggregates before flushing them to spill storage.
    pub group_capacity: usize,
    /// Size of the first chunk mapped by the global pool.
    pub pool_chunk_size: usize,
    /// Row capacity of a result block.
    pub block_size: usize,
    /// Pin worker `t` to logical CPU `t mod cpus`.
    pub pin_workers: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            vector_size: 1024,
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            morsel_size: 10 * 1024,
            join_strategy: JoinStrategy::default(),
            spill_partitions: 64,
            group_capacity: 8192,
            pool_chunk_size: 8 << 20,
            block_size: 16 * 1024,
            pin_workers: true,
        }
    }
}

impl ExecConfig {
    #[must_use]
    pub fn with_vector_size(mut self, vector_size: usize) -> Self {
        self.vector_size = vector_size;
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_morsel_size(mut self, morsel_size: usize) -> Self {
        self.morsel_size = morsel_size;
        self
    }

    #[must_use]
    pub fn with_join_strategy(mut self, strategy: JoinStrategy) -> Self {
        self.join_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_spill_partitions(mut self, partitions: usize) -> Self {
        self.spill_partitions = partitions;
        self
    }

    #[must_use]
    pub fn with_group_capacity(mut self, capacity: usize) -> Self {
        self.group_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_pool_chunk_size(mut self, size: usize) -> Self {
        self.pool_chunk_size = size;
        self
    }

    #[must_use]
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    #[must_use]
    pub fn with_pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    /// Overrides the defaults with `VECTOR_SIZE`, `THREADS`, `MORSEL_SIZE`,
    /// `JOIN_STRATEGY`, `SPILL_PARTITIONS`, `GROUP_CAPACITY` and
    /// `PIN_WORKERS` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_usize("VECTOR_SIZE")? {
            config.vector_size = v;
        }
        if let Some(v) = env_usize("THREADS")? {
            config.threads = v;
        }
        if let Some(v) = env_usize("MORSEL_SIZE")? {
            config.morsel_size = v;
        }
        if let Ok(v) = env::var("JOIN_STRATEGY") {
            config.join_strategy = v.parse()?;
        }
        if let Some(v) = env_usize("SPILL_PARTITIONS")? {
            config.spill_partitions = v;
        }
        if let Some(v) = env_usize("GROUP_CAPACITY")? {
            config.group_capacity = v;
        }
        if let Ok(value) = env::var("PIN_WORKERS") {
            config.pin_workers = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name: "PIN_WORKERS", value })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vector_size == 0 {
            return Err(ConfigError::ZeroVectorSize);
        }
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.morsel_size == 0 {
            return Err(ConfigError::ZeroMorselSize);
        }
        if self.morsel_size < self.vector_size {
            return Err(ConfigError::MorselSmallerThanVector {
                morsel: self.morsel_size,
                vector: self.vector_size,
            });
        }
        if self.group_capacity == 0 {
            return Err(ConfigError::ZeroGroupCapacity);
        }
        Ok(())
    }

    /// Spill partition count rounded up to a power of two.
    pub(crate) fn partitions(&self) -> usize {
        self.spill_partitions.max(1).next_power_of_two()
    }
}

fn env_usize(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}

//! Pluggable stage contracts
//!
//! A process is assembled from five user-supplied capabilities, each with a
//! single entry point:
//!
//! - [`InputStream`] splits a data reference into indexed chunks
//! - [`Mapper`] emits intermediate pairs for one chunk
//! - [`Reducer`] folds every intermediate value of one key into one value
//! - [`Finalizer`] post-processes the reduced pairs of a whole process
//! - [`Outputter`] encodes and decodes final values in the store
//!
//! Implementations are looked up by name through a [`StageRegistry`] built
//! once at worker startup.

pub mod builtin;
pub mod registry;

pub use registry::{Stage, StageKind, StageRegistry};

use async_trait::async_trait;
use thiserror::Error;

use crate::process::{KeyNamespace, Process};
use crate::storage::{KeyValueStore, StorageError};

/// Result type for stage bodies
pub type StageResult<T> = Result<T, StageError>;

/// Failure raised by a stage body
///
/// The stage author decides whether a failure is worth retrying. A unit that
/// fails either way is not counted as completed.
#[derive(Debug, Error)]
pub enum StageError {
    /// Transient; the unit may be redelivered
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Permanent for this unit
    #[error("{0}")]
    Fatal(String),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl StageError {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::Recoverable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Recoverable(_) => true,
            Self::Storage(err) => err.is_retryable(),
            Self::Fatal(_) => false,
        }
    }

    /// Lift into the engine taxonomy for the unit run by `worker`
    pub fn into_engine_error(self, worker: &str) -> crate::Error {
        if self.is_recoverable() {
            crate::Error::RecoverableFail {
                worker: worker.to_string(),
                reason: self.to_string(),
            }
        } else {
            crate::Error::StageFailed {
                worker: worker.to_string(),
                reason: self.to_string(),
            }
        }
    }
}

impl From<crate::Error> for StageError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Storage(err) => Self::Storage(err),
            err if err.is_recoverable() => Self::Recoverable(err.to_string()),
            err => Self::Fatal(err.to_string()),
        }
    }
}

/// One independently processable piece of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputChunk {
    pub index: usize,
    pub data: String,
}

impl InputChunk {
    pub fn new(index: usize, data: impl Into<String>) -> Self {
        Self {
            index,
            data: data.into(),
        }
    }
}

/// One intermediate pair produced by a mapper
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub rank: Option<i64>,
    pub key: String,
    pub value: String,
}

/// Collects the pairs a mapper emits for one chunk
#[derive(Debug, Default)]
pub struct MapEmitter {
    emissions: Vec<Emission>,
}

impl MapEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an unranked pair
    pub fn emit(&mut self, key: impl Into<String>, value: impl ToString) {
        self.emissions.push(Emission {
            rank: None,
            key: key.into(),
            value: value.to_string(),
        });
    }

    /// Emit a pair with an explicit rank, for ordered processes
    pub fn emit_ranked(&mut self, rank: i64, key: impl Into<String>, value: impl ToString) {
        self.emissions.push(Emission {
            rank: Some(rank),
            key: key.into(),
            value: value.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.emissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emissions.is_empty()
    }

    pub fn into_emissions(self) -> Vec<Emission> {
        self.emissions
    }
}

/// Splits a data reference into indexed chunks
#[async_trait]
pub trait InputStream: Send + Sync {
    /// Produce the finite chunk sequence for `data_ref`
    async fn scan(&self, store: &dyn KeyValueStore, data_ref: &str)
        -> StageResult<Vec<InputChunk>>;
}

/// Emits intermediate pairs for one chunk
pub trait Mapper: Send + Sync {
    fn map(&self, chunk: &str, emitter: &mut MapEmitter) -> StageResult<()>;
}

/// Folds all intermediate values of one key into exactly one value
pub trait Reducer: Send + Sync {
    fn reduce(&self, values: &[String]) -> StageResult<String>;
}

/// Post-processes the reduced pairs of a process
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, process: &Process) -> StageResult<()>;
}

/// Where an outputter reads and writes
pub struct OutputContext<'a> {
    pub store: &'a dyn KeyValueStore,
    pub keys: &'a KeyNamespace,
}

/// Encodes final values into the store and decodes them back
///
/// `decode(encode(v)) == v` must hold for every value the process produces.
#[async_trait]
pub trait Outputter: Send + Sync {
    async fn encode(
        &self,
        ctx: &OutputContext<'_>,
        keyname: &str,
        key: &str,
        value: &str,
    ) -> StageResult<()>;

    async fn decode(
        &self,
        ctx: &OutputContext<'_>,
        keyname: &str,
        key: &str,
    ) -> StageResult<Option<String>>;
}

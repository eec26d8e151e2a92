use thiserror::Error;

use crate::process::ProcessState;
use crate::storage::StorageError;

/// Engine error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// A process specification omits or misnames a required stage
    #[error("Specification error: {0}")]
    Specification(String),

    #[error("No such process: {pid}")]
    NotFound { pid: String },

    /// A stage signalled a transient failure; the unit was not completed
    #[error("Recoverable failure in {worker}: {reason}")]
    RecoverableFail { worker: String, reason: String },

    #[error("Stage {worker} failed: {reason}")]
    StageFailed { worker: String, reason: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ProcessState,
        to: ProcessState,
    },

    #[error("No stage registered under {0}")]
    UnknownWorker(String),

    #[error("Malformed job for {worker}: {reason}")]
    MalformedJob { worker: String, reason: String },

    #[error("Process {pid} is ordered; emissions must carry a rank")]
    UnrankedEmission { pid: String },

    /// Engine invariant violated; always a programming error
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the unit that raised this error may be redelivered
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RecoverableFail { .. } => true,
            Self::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Whether this is a "no such process" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

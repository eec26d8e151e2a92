//! Types shared by the storage and queue adapters

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A queued worker invocation
///
/// `worker` names a registered stage implementation; `args` always starts
/// with the owning process id, followed by the stage-specific argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Registered name of the stage implementation to run
    pub worker: String,
    /// Positional arguments, process id first
    pub args: Vec<Value>,
    /// Number of times this job has been redelivered after a recoverable failure
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Job {
    /// Create a new job for `worker` with the given arguments
    pub fn new(worker: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            worker: worker.into(),
            args,
            attempts: 0,
        }
    }

    /// The process id this job belongs to, if the payload carries one
    pub fn pid(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }

    /// Whether this job belongs to `pid`
    pub fn belongs_to(&self, pid: &str) -> bool {
        self.pid() == Some(pid)
    }

    /// The job redelivered once more
    pub fn retried(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }
}

/// Outcome of an atomic remove-with-check on a list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// An element was removed; this many remain
    Popped { remaining: usize },
    /// No matching element was present; nothing was removed
    Empty,
}

impl PopOutcome {
    /// True only for the removal that took the final element
    pub fn emptied(&self) -> bool {
        matches!(self, Self::Popped { remaining: 0 })
    }
}

/// Health status of a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub backend_type: String,
    pub latency_ms: u64,
    pub errors: Vec<String>,
}

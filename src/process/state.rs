//! Process lifecycle states
//!
//! The lifecycle is strictly linear: every state has at most one successor
//! and no state can be re-entered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    NotStarted,
    InputMapInProgress,
    ReduceInProgress,
    FinalizerInProgress,
    Complete,
}

impl ProcessState {
    /// Every state in pipeline order
    pub const ALL: [ProcessState; 5] = [
        ProcessState::NotStarted,
        ProcessState::InputMapInProgress,
        ProcessState::ReduceInProgress,
        ProcessState::FinalizerInProgress,
        ProcessState::Complete,
    ];

    /// The single successor state, `None` once complete
    pub fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::InputMapInProgress),
            Self::InputMapInProgress => Some(Self::ReduceInProgress),
            Self::ReduceInProgress => Some(Self::FinalizerInProgress),
            Self::FinalizerInProgress => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Whether `to` is the immediate successor of `self`
    pub fn is_valid_transition(self, to: Self) -> bool {
        self.next() == Some(to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Whether units of this stage are dispatched through the worker tracker
    pub fn dispatches_work(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Complete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InputMapInProgress => "INPUT_MAP_IN_PROGRESS",
            Self::ReduceInProgress => "REDUCE_IN_PROGRESS",
            Self::FinalizerInProgress => "FINALIZER_IN_PROGRESS",
            Self::Complete => "COMPLETE",
        }
    }

    /// Short lowercase label used in storage keys
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InputMapInProgress => "input_map",
            Self::ReduceInProgress => "reduce",
            Self::FinalizerInProgress => "finalize",
            Self::Complete => "complete",
        }
    }

    /// Human-readable status string
    pub fn status_string(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::InputMapInProgress => "Splitting and mapping input",
            Self::ReduceInProgress => "Reducing intermediate values",
            Self::FinalizerInProgress => "Finalizing output",
            Self::Complete => "Completed",
        }
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Outstanding-unit tracking per (process, stage)
//!
//! Each dispatched unit is represented by one marker in a store list keyed by
//! process and stage. Completing a unit removes its marker with an atomic
//! remove-and-count, and the single removal that leaves the list empty is the
//! one allowed to advance the pipeline.
//!
//! That same removal pushes a hold onto the next stage's list. The hold stays
//! until the next stage has been entered and fully dispatched, so a handoff
//! interrupted by a storage error is still visible to whichever unit retries
//! it, and the next stage cannot empty while its units are still going out.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::process::{KeyNamespace, Process, ProcessId, ProcessState};
use crate::storage::{Job, KeyValueStore, PopOutcome, WorkQueue};

const MARKER: &str = "1";
const HOLD: &str = "hold";

/// Dispatches units and detects stage completion
#[derive(Clone)]
pub struct WorkerTracker {
    store: Arc<dyn KeyValueStore>,
    queue: Arc<dyn WorkQueue>,
    keys: KeyNamespace,
}

impl WorkerTracker {
    pub fn new(engine: &Engine) -> Self {
        Self {
            store: engine.store_handle(),
            queue: engine.queue().clone(),
            keys: engine.keys().clone(),
        }
    }

    /// Dispatch one unit of `stage`
    ///
    /// The marker is pushed before the job is enqueued, so a unit that runs
    /// the moment it is enqueued always finds its own marker.
    pub async fn enslave(
        &self,
        process: &Process,
        stage: ProcessState,
        worker: &str,
        arg: Value,
    ) -> Result<()> {
        if !stage.dispatches_work() {
            return Err(Error::Invariant(format!(
                "cannot dispatch {} for process {} in state {}",
                worker,
                process.pid(),
                stage
            )));
        }

        let pid = process.pid();
        let mut args = vec![Value::String(pid.to_string())];
        if !arg.is_null() {
            args.push(arg);
        }

        let markers = self.keys.slaves(pid, stage);
        let outstanding = self.store.list_push(&markers, MARKER).await?;
        if let Err(e) = self.queue.enqueue(Job::new(worker, args)).await {
            // Undo the marker so the stage can still complete
            if let Err(undo) = self.store.list_remove_check(&markers, MARKER, None).await {
                error!("Failed to release marker for {} after enqueue error: {}", pid, undo);
            }
            return Err(e.into());
        }

        debug!(
            "Dispatched {} for process {} ({} outstanding in {})",
            worker,
            pid,
            outstanding,
            stage.label()
        );
        Ok(())
    }

    /// Markers of one stage of a process
    pub async fn slaves(&self, pid: &ProcessId, stage: ProcessState) -> Result<Vec<String>> {
        Ok(self.store.list_range(&self.keys.slaves(pid, stage), 0, -1).await?)
    }

    /// Number of outstanding units of one stage
    pub async fn outstanding(&self, pid: &ProcessId, stage: ProcessState) -> Result<usize> {
        Ok(self.store.list_len(&self.keys.slaves(pid, stage)).await?)
    }

    /// Complete one unit; true only for the call that emptied the stage
    ///
    /// A call against an already-empty stage changes nothing and returns
    /// false, so duplicate completions never trigger a second advance.
    pub async fn free_slave(&self, pid: &ProcessId, stage: ProcessState) -> Result<bool> {
        Ok(self.complete(pid, stage).await?.emptied())
    }

    /// Remove one unit marker of `stage`, placing a hold on the next stage
    /// if that emptied it
    pub(crate) async fn complete(
        &self,
        pid: &ProcessId,
        stage: ProcessState,
    ) -> Result<PopOutcome> {
        let outcome = self.remove(pid, stage, MARKER).await?;
        match outcome {
            PopOutcome::Popped { remaining: 0 } => {
                debug!("Process {} finished {}", pid, stage.label());
            }
            PopOutcome::Popped { remaining } => {
                debug!(
                    "Process {} has {} units left in {}",
                    pid,
                    remaining,
                    stage.label()
                );
            }
            PopOutcome::Empty => {
                warn!(
                    "Completion for process {} in {} with no outstanding units",
                    pid,
                    stage.label()
                );
            }
        }
        Ok(outcome)
    }

    /// Drop the hold on `stage` once its units are dispatched
    ///
    /// If nothing else is outstanding the stage is finished on the spot and
    /// the hold moves on to the stage after it.
    pub(crate) async fn release_hold(
        &self,
        pid: &ProcessId,
        stage: ProcessState,
    ) -> Result<PopOutcome> {
        self.remove(pid, stage, HOLD).await
    }

    /// Whether a handoff into `stage` is still unfinished
    pub(crate) async fn hold_pending(&self, pid: &ProcessId, stage: ProcessState) -> Result<bool> {
        Ok(self.slaves(pid, stage).await?.iter().any(|m| m == HOLD))
    }

    async fn remove(
        &self,
        pid: &ProcessId,
        stage: ProcessState,
        value: &str,
    ) -> Result<PopOutcome> {
        let markers = self.keys.slaves(pid, stage);
        let next = stage.next().map(|next| self.keys.slaves(pid, next));
        let on_empty = next.as_deref().map(|next| (next, HOLD));
        Ok(self.store.list_remove_check(&markers, value, on_empty).await?)
    }

    /// Drop every marker and hold of a process; returns how many lists existed
    pub async fn emancipate(&self, pid: &ProcessId) -> Result<usize> {
        let lists: Vec<String> = ProcessState::ALL
            .into_iter()
            .filter(|stage| *stage != ProcessState::NotStarted)
            .map(|stage| self.keys.slaves(pid, stage))
            .collect();
        Ok(self.store.delete(&lists).await?)
    }
}

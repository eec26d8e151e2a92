//! Processes and their lifecycle
//!
//! A [`Process`] is one MapReduce job: an identity, the specification naming
//! its stages, and a lifecycle state. The record is persisted as a single JSON
//! document so every update is one store write. Workers on other machines may
//! advance the state at any time, so anything that acts on `state` reloads
//! first.

pub mod intermediate;
pub mod keys;
pub mod specification;
pub mod state;

pub use intermediate::{IntermediateStore, RankedPair};
pub use keys::{key_hash, key_segment, KeyNamespace};
pub use specification::{ProcessSpecification, ProcessUpdate, SpecificationBuilder};
pub use state::ProcessState;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::coordination::{Worker, WorkerTracker};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::stages::{OutputContext, Outputter};

/// Opaque unique process identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    /// Allocate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProcessId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted form of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: ProcessId,
    pub specification: ProcessSpecification,
    pub state: ProcessState,
    /// Whether work runs inline in the caller instead of through the queue
    #[serde(default)]
    pub synchronous: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessRecord {
    fn new(pid: ProcessId, specification: ProcessSpecification) -> Self {
        let now = Utc::now();
        Self {
            pid,
            specification,
            state: ProcessState::NotStarted,
            synchronous: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Snapshot of a process's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub pid: ProcessId,
    pub state: ProcessState,
    /// Units of the current stage not yet completed
    pub outstanding: usize,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}), {} outstanding",
            self.pid,
            self.state,
            self.state.status_string(),
            self.outstanding
        )
    }
}

/// One MapReduce job bound to the engine it runs in
#[derive(Clone)]
pub struct Process {
    engine: Engine,
    record: ProcessRecord,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("record", &self.record)
            .finish()
    }
}

impl Process {
    /// Persist a new process in state NOT_STARTED
    ///
    /// Every stage the specification names must be registered in the
    /// engine's registry with the matching role.
    pub async fn create(engine: &Engine, specification: ProcessSpecification) -> Result<Self> {
        engine.registry().validate(&specification)?;

        let mut process = Self {
            engine: engine.clone(),
            record: ProcessRecord::new(ProcessId::generate(), specification),
        };
        process.save().await?;
        info!("Created process {}", process.pid());
        Ok(process)
    }

    /// Load a persisted process
    pub async fn open(engine: &Engine, pid: &ProcessId) -> Result<Self> {
        let record = Self::load_record(engine, pid).await?;
        Ok(Self {
            engine: engine.clone(),
            record,
        })
    }

    async fn load_record(engine: &Engine, pid: &ProcessId) -> Result<ProcessRecord> {
        let raw = engine
            .store()
            .get(&engine.keys().process(pid))
            .await?
            .ok_or_else(|| Error::NotFound {
                pid: pid.to_string(),
            })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Ids of every known process, sorted
    pub async fn list(engine: &Engine) -> Result<Vec<ProcessId>> {
        let mut pids: Vec<ProcessId> = engine
            .store()
            .set_members(&engine.keys().processes())
            .await?
            .into_iter()
            .map(ProcessId::from)
            .collect();
        pids.sort();
        Ok(pids)
    }

    /// Remove every pending queued unit of `pid`; returns how many were removed
    ///
    /// Units already picked up by a worker run to completion.
    pub async fn kill(engine: &Engine, pid: &ProcessId) -> Result<usize> {
        let cancelled = engine.queue().cancel(pid.as_str()).await?;
        let markers = engine.tracker().emancipate(pid).await?;
        info!(
            "Killed process {}: {} pending units cancelled, {} markers released",
            pid, cancelled, markers
        );
        Ok(cancelled)
    }

    /// [`Process::kill`] over every known process
    pub async fn kill_all(engine: &Engine) -> Result<usize> {
        let mut cancelled = 0;
        for pid in Self::list(engine).await? {
            cancelled += Self::kill(engine, &pid).await?;
        }
        Ok(cancelled)
    }

    pub fn pid(&self) -> &ProcessId {
        &self.record.pid
    }

    pub fn specification(&self) -> &ProcessSpecification {
        &self.record.specification
    }

    /// State as of the last load; call [`Process::reload`] for the current one
    pub fn state(&self) -> ProcessState {
        self.record.state
    }

    pub fn is_synchronous(&self) -> bool {
        self.record.synchronous
    }

    pub fn is_ordered(&self) -> bool {
        self.record.specification.ordered
    }

    pub fn record(&self) -> &ProcessRecord {
        &self.record
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Output namespace: the specification's keyname, or a per-process default
    pub fn keyname(&self) -> String {
        self.record
            .specification
            .keyname
            .clone()
            .unwrap_or_else(|| self.engine.keys().default_keyname(self.pid()))
    }

    /// Write the in-memory record to the store in one write
    pub async fn save(&mut self) -> Result<()> {
        self.record.updated_at = Utc::now();
        let raw = serde_json::to_string(&self.record)?;
        let keys = self.engine.keys();
        self.engine.store().set(&keys.process(self.pid()), &raw).await?;
        self.engine
            .store()
            .set_add(&keys.processes(), self.pid().as_str())
            .await?;
        Ok(())
    }

    /// Replace the in-memory record with the persisted one
    pub async fn reload(&mut self) -> Result<()> {
        self.record = Self::load_record(&self.engine, self.pid()).await?;
        Ok(())
    }

    /// Merge `update` into the persisted process
    ///
    /// A state may be set directly, but never to one behind the current state.
    /// A write that raced with another one is retried against the newer record.
    pub async fn update(&mut self, update: ProcessUpdate) -> Result<()> {
        let engine = self.engine.clone();
        self.transact(|record| {
            if let Some(to) = update.state {
                if to < record.state {
                    return Err(Error::InvalidTransition {
                        from: record.state,
                        to,
                    });
                }
            }

            let mut specification = record.specification.clone();
            update.apply_to(&mut specification);
            if specification != record.specification {
                engine.registry().validate(&specification)?;
                record.specification = specification;
            }
            if let Some(state) = update.state {
                record.state = state;
            }
            if let Some(synchronous) = update.synchronous {
                record.synchronous = synchronous;
            }
            Ok(true)
        })
        .await?;
        debug!("Updated process {}", self.pid());
        Ok(())
    }

    /// Rewrite the persisted record through `change`, only if nobody else
    /// wrote it in between; conflicting writes are retried
    ///
    /// `change` returns whether there is anything to write. Either way the
    /// in-memory record ends up as the persisted one.
    async fn transact<F>(&mut self, mut change: F) -> Result<bool>
    where
        F: FnMut(&mut ProcessRecord) -> Result<bool>,
    {
        let key = self.engine.keys().process(self.pid());
        loop {
            let raw = self
                .engine
                .store()
                .get(&key)
                .await?
                .ok_or_else(|| Error::NotFound {
                    pid: self.pid().to_string(),
                })?;
            let current: ProcessRecord = serde_json::from_str(&raw)?;

            let mut record = current.clone();
            let write = match change(&mut record) {
                Ok(write) => write,
                Err(e) => {
                    self.record = current;
                    return Err(e);
                }
            };
            if !write {
                self.record = current;
                return Ok(false);
            }

            record.updated_at = Utc::now();
            let updated = serde_json::to_string(&record)?;
            if self
                .engine
                .store()
                .compare_and_set(&key, &raw, &updated)
                .await?
            {
                self.record = record;
                return Ok(true);
            }
            debug!("Process {} was written concurrently; retrying", self.pid());
        }
    }

    /// Store `text` as this process's own input and return its key
    ///
    /// The key is owned by the process and removed by [`Process::delete`].
    pub async fn stage_input(&self, text: &str) -> Result<String> {
        let key = self.engine.keys().upload(self.pid());
        self.engine.store().set(&key, text).await?;
        Ok(key)
    }

    /// Remove the process and everything it owns; idempotent
    ///
    /// Output written through the outputter is kept.
    pub async fn delete(&self) -> Result<()> {
        let keys = self.engine.keys();
        let pid = self.pid();

        let intermediate = self.intermediate().clear().await?;
        let markers = self.engine.tracker().emancipate(pid).await?;
        self.engine
            .store()
            .delete(&[keys.process(pid), keys.input(pid), keys.upload(pid)])
            .await?;
        self.engine
            .store()
            .set_remove(&keys.processes(), pid.as_str())
            .await?;

        info!(
            "Deleted process {} ({} intermediate keys, {} markers)",
            pid, intermediate, markers
        );
        Ok(())
    }

    /// Start the pipeline over the input referenced by `data_ref`
    ///
    /// Synchronous runs execute every unit inline, depth-first, before
    /// returning; otherwise the first unit is only enqueued.
    pub async fn run(&mut self, data_ref: &str, synchronous: bool) -> Result<()> {
        self.transact(|record| {
            if record.state != ProcessState::NotStarted {
                return Err(Error::InvalidTransition {
                    from: record.state,
                    to: ProcessState::InputMapInProgress,
                });
            }
            record.synchronous = synchronous;
            record.state = ProcessState::InputMapInProgress;
            Ok(true)
        })
        .await?;
        info!(
            "Process {} {} -> {}",
            self.pid(),
            ProcessState::NotStarted,
            ProcessState::InputMapInProgress
        );

        let engine = if synchronous {
            self.engine.inline()
        } else {
            self.engine.clone()
        };
        let inputter = self.record.specification.inputter.clone();
        WorkerTracker::new(&engine)
            .enslave(
                self,
                ProcessState::InputMapInProgress,
                &inputter,
                json!(data_ref),
            )
            .await?;

        if synchronous {
            let executed = Worker::new(engine).drain().await?;
            debug!("Ran {} units inline for process {}", executed, self.pid());
            self.reload().await?;
        }
        Ok(())
    }

    /// Force the state one step forward without dispatching any work
    ///
    /// Administrative entry point; stage drivers advance through
    /// [`Process::advance_from`].
    pub async fn next_state(&mut self) -> Result<ProcessState> {
        self.transact(|record| {
            let from = record.state;
            record.state = from
                .next()
                .ok_or(Error::InvalidTransition { from, to: from })?;
            Ok(true)
        })
        .await?;
        info!("Process {} forced to {}", self.pid(), self.record.state);
        Ok(self.record.state)
    }

    /// Advance past `completed` if the process is still in it
    ///
    /// Called by the driver handing off out of `completed`. Returns whether
    /// this call wrote the new state.
    pub(crate) async fn advance_from(&mut self, completed: ProcessState) -> Result<bool> {
        let to = completed.next().ok_or(Error::InvalidTransition {
            from: completed,
            to: completed,
        })?;
        let advanced = self
            .transact(|record| {
                if record.state != completed {
                    return Ok(false);
                }
                record.state = to;
                Ok(true)
            })
            .await?;
        if advanced {
            info!("Process {} {} -> {}", self.pid(), completed, to);
        } else {
            debug!(
                "Process {} is {}, not {}; skipping advance",
                self.pid(),
                self.record.state,
                completed
            );
        }
        Ok(advanced)
    }

    /// Progress snapshot from the persisted state
    pub async fn status(&mut self) -> Result<ProcessStatus> {
        self.reload().await?;
        let state = self.record.state;
        let outstanding = if state.dispatches_work() {
            self.engine.tracker().outstanding(self.pid(), state).await?
        } else {
            0
        };
        Ok(ProcessStatus {
            pid: self.pid().clone(),
            state,
            outstanding,
            updated_at: self.record.updated_at,
        })
    }

    /// Outstanding-unit markers of the current stage
    pub async fn slaves(&self) -> Result<Vec<String>> {
        self.engine.tracker().slaves(self.pid(), self.state()).await
    }

    /// The intermediate tables of this process
    pub fn intermediate(&self) -> IntermediateStore {
        IntermediateStore::new(
            self.engine.store_handle(),
            self.engine.keys().clone(),
            self.pid().clone(),
            self.is_ordered(),
        )
    }

    pub async fn emit_intermediate(&self, key: &str, value: &str) -> Result<()> {
        self.intermediate().emit_intermediate(key, value).await
    }

    pub async fn emit_intermediate_ranked(&self, rank: i64, key: &str, value: &str) -> Result<()> {
        self.intermediate()
            .emit_intermediate_ranked(rank, key, value)
            .await
    }

    pub async fn emit(&self, key: &str, value: &str) -> Result<()> {
        self.intermediate().emit(key, value).await
    }

    pub async fn map_keys(&self) -> Result<Vec<String>> {
        self.intermediate().map_keys().await
    }

    pub async fn map_values(&self, key: &str) -> Result<Vec<String>> {
        self.intermediate().map_values(key).await
    }

    pub async fn reduce_values(&self, key: &str) -> Result<Vec<String>> {
        self.intermediate().reduce_values(key).await
    }

    pub fn each_key_nonreduced_value(&self) -> BoxStream<'static, Result<(String, String)>> {
        self.intermediate().each_key_nonreduced_value()
    }

    pub fn each_key_reduced_value(&self) -> BoxStream<'static, Result<(String, String)>> {
        self.intermediate().each_key_reduced_value()
    }

    /// Every reduced pair, collected
    pub async fn reduced_pairs(&self) -> Result<Vec<(String, String)>> {
        self.each_key_reduced_value().try_collect().await
    }

    /// The registered outputter, if the specification names one
    pub fn outputter(&self) -> Result<Option<Arc<dyn Outputter>>> {
        self.record
            .specification
            .outputter
            .as_deref()
            .map(|name| self.engine.registry().outputter(name))
            .transpose()
    }

    fn require_outputter(&self) -> Result<Arc<dyn Outputter>> {
        self.outputter()?.ok_or_else(|| {
            Error::Specification(format!("process {} has no outputter", self.pid()))
        })
    }

    /// Write a final value under this process's keyname
    pub async fn encode(&self, key: &str, value: &str) -> Result<()> {
        let outputter = self.require_outputter()?;
        let ctx = self.output_context();
        outputter
            .encode(&ctx, &self.keyname(), key, value)
            .await
            .map_err(|e| e.into_engine_error("outputter"))
    }

    /// Read a final value back from this process's keyname
    pub async fn decode(&self, key: &str) -> Result<Option<String>> {
        let outputter = self.require_outputter()?;
        let ctx = self.output_context();
        outputter
            .decode(&ctx, &self.keyname(), key)
            .await
            .map_err(|e| e.into_engine_error("outputter"))
    }

    fn output_context(&self) -> OutputContext<'_> {
        OutputContext {
            store: self.engine.store(),
            keys: self.engine.keys(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageRegistry;

    fn engine() -> Engine {
        Engine::in_memory(StageRegistry::with_builtins())
    }

    fn word_count() -> ProcessSpecification {
        ProcessSpecification::builder()
            .inputter("word_stream")
            .mapper("word_counter")
            .reducer("adder")
            .finalizer("to_hash")
            .outputter("hash_outputter")
            .keyname("test:result")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_open() {
        let engine = engine();
        let process = Process::create(&engine, word_count()).await.unwrap();
        assert_eq!(process.state(), ProcessState::NotStarted);

        let opened = Process::open(&engine, process.pid()).await.unwrap();
        assert_eq!(opened.specification(), process.specification());
        assert_eq!(opened.state(), ProcessState::NotStarted);
        assert_eq!(Process::list(&engine).await.unwrap(), [process.pid().clone()]);
    }

    #[tokio::test]
    async fn test_create_rejects_unregistered_stage() {
        let mut spec = word_count();
        spec.mapper = "WordCounter".to_string();
        let err = Process::create(&engine(), spec).await.unwrap_err();
        assert!(matches!(err, Error::Specification(_)));
    }

    #[tokio::test]
    async fn test_open_missing() {
        let err = Process::open(&engine(), &ProcessId::from("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_save_and_update() {
        let engine = engine();
        let mut process = Process::create(&engine, word_count()).await.unwrap();

        process.record.specification.mapper = "char_counter".to_string();
        process.record.synchronous = true;
        process.save().await.unwrap();
        let opened = Process::open(&engine, process.pid()).await.unwrap();
        assert_eq!(opened.specification().mapper, "char_counter");
        assert!(opened.is_synchronous());

        process
            .update(ProcessUpdate::default().mapper("word_counter").ordered(true))
            .await
            .unwrap();
        let opened = Process::open(&engine, process.pid()).await.unwrap();
        assert_eq!(opened.specification().mapper, "word_counter");
        assert!(opened.is_ordered());
    }

    #[tokio::test]
    async fn test_update_never_regresses_state() {
        let engine = engine();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        process
            .update(ProcessUpdate::default().state(ProcessState::ReduceInProgress))
            .await
            .unwrap();

        let err = process
            .update(ProcessUpdate::default().state(ProcessState::InputMapInProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(process.state(), ProcessState::ReduceInProgress);
    }

    #[tokio::test]
    async fn test_next_state_walks_lifecycle() {
        let engine = engine();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        for expected in &ProcessState::ALL[1..] {
            assert_eq!(process.next_state().await.unwrap(), *expected);
        }
        assert!(matches!(
            process.next_state().await,
            Err(Error::InvalidTransition { .. })
        ));
        // Administrative advance dispatches nothing
        assert_eq!(engine.queue().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_advance_is_guarded() {
        let engine = engine();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        process
            .update(ProcessUpdate::default().state(ProcessState::ReduceInProgress))
            .await
            .unwrap();

        assert!(!process.advance_from(ProcessState::InputMapInProgress).await.unwrap());
        assert_eq!(process.state(), ProcessState::ReduceInProgress);
        assert!(process.advance_from(ProcessState::ReduceInProgress).await.unwrap());
        assert!(!process.advance_from(ProcessState::ReduceInProgress).await.unwrap());
        assert_eq!(process.state(), ProcessState::FinalizerInProgress);
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let engine = engine();
        engine.store().set("input", "a b c").await.unwrap();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        process.run("input", false).await.unwrap();
        assert_eq!(process.state(), ProcessState::InputMapInProgress);

        let err = process.run("input", false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(engine.queue().size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let engine = engine();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        process.emit_intermediate("k", "v").await.unwrap();
        process.emit("k", "v").await.unwrap();
        process
            .update(ProcessUpdate::default().state(ProcessState::InputMapInProgress))
            .await
            .unwrap();
        engine
            .tracker()
            .enslave(&process, ProcessState::InputMapInProgress, "word_counter", json!(0))
            .await
            .unwrap();
        let upload = process.stage_input("a b c").await.unwrap();

        process.delete().await.unwrap();
        process.delete().await.unwrap();

        assert!(Process::open(&engine, process.pid()).await.unwrap_err().is_not_found());
        assert!(process.slaves().await.unwrap().is_empty());
        assert!(process.map_keys().await.unwrap().is_empty());
        assert!(Process::list(&engine).await.unwrap().is_empty());
        assert_eq!(engine.store().get(&upload).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stage_input_is_per_process() {
        let engine = engine();
        let first = Process::create(&engine, word_count()).await.unwrap();
        let second = Process::create(&engine, word_count()).await.unwrap();

        let key = first.stage_input("one").await.unwrap();
        assert_ne!(key, second.stage_input("two").await.unwrap());
        assert_eq!(engine.store().get(&key).await.unwrap().as_deref(), Some("one"));

        first.delete().await.unwrap();
        assert_eq!(engine.store().get(&key).await.unwrap(), None);
        let kept = engine.keys().upload(second.pid());
        assert_eq!(engine.store().get(&kept).await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_update_keeps_concurrent_advance() {
        let (engine, store) = crate::storage::testing::faulty_engine();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        process
            .update(ProcessUpdate::default().state(ProcessState::InputMapInProgress))
            .await
            .unwrap();

        // Another worker advances the process between this update's read and write
        let mut advanced = process.record().clone();
        advanced.state = ProcessState::ReduceInProgress;
        store.overwrite_after_get(
            &engine.keys().process(process.pid()),
            &serde_json::to_string(&advanced).unwrap(),
        );

        process
            .update(ProcessUpdate::default().mapper("char_counter"))
            .await
            .unwrap();

        let opened = Process::open(&engine, process.pid()).await.unwrap();
        assert_eq!(opened.state(), ProcessState::ReduceInProgress);
        assert_eq!(opened.specification().mapper, "char_counter");
        assert_eq!(process.state(), ProcessState::ReduceInProgress);
    }

    #[tokio::test]
    async fn test_advance_loses_to_concurrent_advance() {
        let (engine, store) = crate::storage::testing::faulty_engine();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        process
            .update(ProcessUpdate::default().state(ProcessState::ReduceInProgress))
            .await
            .unwrap();

        let mut advanced = process.record().clone();
        advanced.state = ProcessState::FinalizerInProgress;
        store.overwrite_after_get(
            &engine.keys().process(process.pid()),
            &serde_json::to_string(&advanced).unwrap(),
        );

        assert!(!process.advance_from(ProcessState::ReduceInProgress).await.unwrap());
        assert_eq!(process.state(), ProcessState::FinalizerInProgress);
    }

    #[tokio::test]
    async fn test_keyname_default() {
        let engine = engine();
        let mut spec = word_count();
        spec.keyname = None;
        let process = Process::create(&engine, spec).await.unwrap();
        assert_eq!(
            process.keyname(),
            format!("mapstage:result:{}", process.pid())
        );
    }

    #[tokio::test]
    async fn test_encode_requires_outputter() {
        let engine = engine();
        let mut spec = word_count();
        spec.outputter = None;
        let process = Process::create(&engine, spec).await.unwrap();
        assert!(process.outputter().unwrap().is_none());
        assert!(matches!(
            process.encode("k", "v").await,
            Err(Error::Specification(_))
        ));
    }
}

//! Stage drivers
//!
//! A driver executes one queued unit: it resolves the job's worker name in
//! the registry, runs the user stage, records its output, and completes the
//! unit with the tracker. Only the driver whose completion empties a stage
//! hands the process off to the next stage.
//!
//! A unit whose stage has already closed does nothing, unless the handoff
//! out of that stage is still held open, in which case it finishes the
//! handoff instead. Retried and redelivered units are therefore harmless.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ReducePolicy;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::process::{Process, ProcessId, ProcessState};
use crate::stages::{Finalizer, InputStream, MapEmitter, Mapper, Reducer, Stage};
use crate::storage::{Job, PopOutcome};

/// A queued job resolved to its stage implementation and argument
enum Unit<'a> {
    Input(Arc<dyn InputStream>, &'a str),
    Map(Arc<dyn Mapper>, u64),
    Reduce(Arc<dyn Reducer>, &'a str),
    Finalize(Arc<dyn Finalizer>),
}

impl<'a> Unit<'a> {
    fn parse(stage: Stage, job: &'a Job) -> Result<Self> {
        Ok(match stage {
            Stage::Input(inputter) => Unit::Input(inputter, string_arg(job)?),
            Stage::Map(mapper) => {
                let index = job
                    .args
                    .get(1)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| malformed(job, "second argument must be a chunk index"))?;
                Unit::Map(mapper, index)
            }
            Stage::Reduce(reducer) => Unit::Reduce(reducer, string_arg(job)?),
            Stage::Finalize(finalizer) => Unit::Finalize(finalizer),
            Stage::Output(_) => return Err(malformed(job, "outputters are not queued units")),
        })
    }

    /// The stage whose counter this unit is tracked in
    fn stage(&self) -> ProcessState {
        match self {
            Unit::Input(..) | Unit::Map(..) => ProcessState::InputMapInProgress,
            Unit::Reduce(..) => ProcessState::ReduceInProgress,
            Unit::Finalize(_) => ProcessState::FinalizerInProgress,
        }
    }
}

/// Run one unit to completion
pub async fn perform(engine: &Engine, job: &Job) -> Result<()> {
    let stage = engine.registry().resolve(&job.worker)?.clone();
    let pid = job
        .pid()
        .map(ProcessId::from)
        .ok_or_else(|| malformed(job, "first argument must be a process id"))?;
    let unit = Unit::parse(stage, job)?;
    let mut process = Process::open(engine, &pid).await?;

    if !claim(&mut process, &job.worker, unit.stage()).await? {
        return Ok(());
    }

    let worker = job.worker.as_str();
    match unit {
        Unit::Input(inputter, data_ref) => {
            run_inputter(&mut process, worker, inputter, data_ref).await
        }
        Unit::Map(mapper, index) => run_mapper(&mut process, worker, mapper, index).await,
        Unit::Reduce(reducer, key) => run_reducer(&mut process, worker, reducer, key).await,
        Unit::Finalize(finalizer) => run_finalizer(&mut process, worker, finalizer).await,
    }
}

/// Decide whether a unit of `unit_stage` should run at all
///
/// Returns false when the stage has closed. If the handoff out of it was
/// left unfinished, it is completed here first.
async fn claim(process: &mut Process, worker: &str, unit_stage: ProcessState) -> Result<bool> {
    let tracker = process.engine().tracker();
    if let Some(next) = unit_stage.next() {
        if tracker.hold_pending(process.pid(), next).await? {
            info!(
                "Resuming handoff of process {} out of {} from {}",
                process.pid(),
                unit_stage.label(),
                worker
            );
            handoff(process, unit_stage).await?;
            return Ok(false);
        }
    }
    if process.state() != unit_stage {
        warn!(
            "Skipping {} for process {}: it is {}, not {}",
            worker,
            process.pid(),
            process.state(),
            unit_stage
        );
        return Ok(false);
    }
    Ok(true)
}

fn malformed(job: &Job, reason: &str) -> Error {
    Error::MalformedJob {
        worker: job.worker.clone(),
        reason: reason.to_string(),
    }
}

fn string_arg(job: &Job) -> Result<&str> {
    job.args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(job, "second argument must be a string"))
}

/// Split the input, store each chunk, and dispatch one mapper per chunk
///
/// The inputter's own marker stays until every mapper is dispatched, so fast
/// mappers cannot empty the stage early.
async fn run_inputter(
    process: &mut Process,
    worker: &str,
    inputter: Arc<dyn InputStream>,
    data_ref: &str,
) -> Result<()> {
    let engine = process.engine().clone();
    let chunks = inputter
        .scan(engine.store(), data_ref)
        .await
        .map_err(|e| e.into_engine_error(worker))?;

    let input = engine.keys().input(process.pid());
    let mapper = process.specification().mapper.clone();
    let tracker = engine.tracker();
    for chunk in &chunks {
        engine
            .store()
            .hash_set(&input, &chunk.index.to_string(), &chunk.data)
            .await?;
        tracker
            .enslave(
                process,
                ProcessState::InputMapInProgress,
                &mapper,
                json!(chunk.index),
            )
            .await?;
    }
    info!(
        "Split input {} into {} chunks for process {}",
        data_ref,
        chunks.len(),
        process.pid()
    );

    complete_unit(process, ProcessState::InputMapInProgress).await
}

async fn run_mapper(
    process: &mut Process,
    worker: &str,
    mapper: Arc<dyn Mapper>,
    index: u64,
) -> Result<()> {
    let engine = process.engine().clone();
    let chunk = engine
        .store()
        .hash_get(&engine.keys().input(process.pid()), &index.to_string())
        .await?
        .ok_or_else(|| Error::StageFailed {
            worker: worker.to_string(),
            reason: format!("chunk {} of process {} is missing", index, process.pid()),
        })?;

    let mut emitter = MapEmitter::new();
    mapper
        .map(&chunk, &mut emitter)
        .map_err(|e| e.into_engine_error(worker))?;

    let intermediate = process.intermediate();
    let emitted = emitter.len();
    for emission in emitter.into_emissions() {
        match emission.rank {
            Some(rank) => {
                intermediate
                    .emit_intermediate_ranked(rank, &emission.key, &emission.value)
                    .await?
            }
            None => {
                intermediate
                    .emit_intermediate(&emission.key, &emission.value)
                    .await?
            }
        }
    }
    debug!(
        "Mapped chunk {} of process {} into {} pairs",
        index,
        process.pid(),
        emitted
    );

    complete_unit(process, ProcessState::InputMapInProgress).await
}

async fn run_reducer(
    process: &mut Process,
    worker: &str,
    reducer: Arc<dyn Reducer>,
    key: &str,
) -> Result<()> {
    let intermediate = process.intermediate();
    let values = intermediate.map_values(key).await?;
    let reduced = reducer
        .reduce(&values)
        .map_err(|e| e.into_engine_error(worker))?;

    match process.engine().config().reduce_policy {
        ReducePolicy::Replace => intermediate.replace(key, &reduced).await?,
        ReducePolicy::Append => intermediate.emit(key, &reduced).await?,
    }
    debug!(
        "Reduced {} values of {:?} for process {}",
        values.len(),
        key,
        process.pid()
    );

    complete_unit(process, ProcessState::ReduceInProgress).await
}

async fn run_finalizer(
    process: &mut Process,
    worker: &str,
    finalizer: Arc<dyn Finalizer>,
) -> Result<()> {
    finalizer
        .finalize(process)
        .await
        .map_err(|e| e.into_engine_error(worker))?;

    complete_unit(process, ProcessState::FinalizerInProgress).await
}

/// Free this unit's marker and, if the stage is now finished, hand off
///
/// A retry whose marker was already removed by the failed attempt finds the
/// hold on the next stage and finishes the handoff that attempt started.
async fn complete_unit(process: &mut Process, stage: ProcessState) -> Result<()> {
    let tracker = process.engine().tracker();
    match tracker.complete(process.pid(), stage).await? {
        PopOutcome::Popped { remaining: 0 } => handoff(process, stage).await,
        PopOutcome::Popped { .. } => Ok(()),
        PopOutcome::Empty => {
            let pending = match stage.next() {
                Some(next) => tracker.hold_pending(process.pid(), next).await?,
                None => false,
            };
            if pending {
                handoff(process, stage).await
            } else {
                Ok(())
            }
        }
    }
}

/// Advance out of the finished stage `from`, dispatch the stage it enters,
/// then release that stage's hold
///
/// Every step is safe to repeat, so an interrupted handoff is resumed by
/// running it again. A stage that dispatches nothing finishes on release,
/// and the loop carries on into the stage after it.
async fn handoff(process: &mut Process, from: ProcessState) -> Result<()> {
    let tracker = process.engine().tracker();
    let mut from = from;
    while let Some(next) = from.next() {
        process.advance_from(from).await?;
        if process.state() == next {
            dispatch(process, next).await?;
        }
        if !tracker.release_hold(process.pid(), next).await?.emptied() {
            break;
        }
        from = next;
    }
    Ok(())
}

/// Enqueue every unit of a freshly entered stage
async fn dispatch(process: &mut Process, stage: ProcessState) -> Result<()> {
    let tracker = process.engine().tracker();
    match stage {
        ProcessState::ReduceInProgress => {
            let keys = process.map_keys().await?;
            if keys.is_empty() {
                info!("Process {} emitted no keys; skipping reduce", process.pid());
            }
            let reducer = process.specification().reducer.clone();
            for key in &keys {
                tracker
                    .enslave(process, stage, &reducer, json!(key))
                    .await?;
            }
            info!(
                "Dispatched {} reducers for process {}",
                keys.len(),
                process.pid()
            );
        }
        ProcessState::FinalizerInProgress => {
            match process.specification().finalizer.clone() {
                Some(finalizer) => {
                    tracker
                        .enslave(process, stage, &finalizer, Value::Null)
                        .await?
                }
                None => info!("Process {} has no finalizer", process.pid()),
            }
        }
        ProcessState::Complete => info!("Process {} complete", process.pid()),
        other => {
            return Err(Error::Invariant(format!(
                "stage {} is not entered by a handoff",
                other
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Worker;
    use crate::process::{ProcessSpecification, ProcessUpdate};
    use crate::stages::StageRegistry;
    use crate::storage::testing::{faulty_engine, FaultyStore};

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

    async fn setup() -> (Engine, Process) {
        let engine = Engine::in_memory(StageRegistry::with_builtins());
        engine.store().set("wordstream:test", "data").await.unwrap();
        let process = Process::create(&engine, word_count()).await.unwrap();
        (engine, process)
    }

    /// A queued run over a store that can be made to fail
    async fn faulty_setup() -> (Engine, Arc<FaultyStore>, Process) {
        let (engine, store) = faulty_engine();
        engine.store().set("wordstream:test", "data").await.unwrap();
        let mut process = Process::create(&engine, word_count()).await.unwrap();
        process.run("wordstream:test", false).await.unwrap();
        (engine, store, process)
    }

    fn peek_json(jobs: &[Job]) -> Value {
        serde_json::to_value(jobs).unwrap()
    }

    #[tokio::test]
    async fn test_map_proceeds_to_reduce() {
        let (engine, mut process) = setup().await;
        process
            .update(ProcessUpdate::default().state(ProcessState::InputMapInProgress))
            .await
            .unwrap();
        let pid = process.pid().as_str().to_string();

        let tracker = engine.tracker();
        tracker
            .enslave(
                &process,
                ProcessState::InputMapInProgress,
                "word_stream",
                json!("wordstream:test"),
            )
            .await
            .unwrap();
        let job = engine.queue().reserve().await.unwrap().unwrap();
        perform(&engine, &job).await.unwrap();

        let jobs = engine.queue().peek(0, None).await.unwrap();
        assert_eq!(
            peek_json(&jobs),
            json!([{"worker": "word_counter", "args": [pid, 0]}])
        );

        let job = engine.queue().reserve().await.unwrap().unwrap();
        perform(&engine, &job).await.unwrap();

        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::ReduceInProgress);
        let jobs = engine.queue().peek(0, None).await.unwrap();
        assert_eq!(
            peek_json(&jobs),
            json!([{"worker": "adder", "args": [pid, "data"]}])
        );
    }

    #[tokio::test]
    async fn test_reduce_proceeds_to_finalize() {
        let (engine, mut process) = setup().await;
        process
            .update(ProcessUpdate::default().state(ProcessState::ReduceInProgress))
            .await
            .unwrap();
        process.emit_intermediate("data", "1").await.unwrap();
        engine
            .tracker()
            .enslave(&process, ProcessState::ReduceInProgress, "adder", json!("data"))
            .await
            .unwrap();
        let job = engine.queue().reserve().await.unwrap().unwrap();
        perform(&engine, &job).await.unwrap();

        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::FinalizerInProgress);
        assert_eq!(process.reduce_values("data").await.unwrap(), ["1"]);
        let jobs = engine.queue().peek(0, None).await.unwrap();
        assert_eq!(
            peek_json(&jobs),
            json!([{"worker": "to_hash", "args": [process.pid().as_str()]}])
        );
    }

    #[tokio::test]
    async fn test_finalizer_saves_and_completes() {
        let (engine, mut process) = setup().await;
        process
            .update(ProcessUpdate::default().state(ProcessState::FinalizerInProgress))
            .await
            .unwrap();
        process.emit_intermediate("data", "1").await.unwrap();
        process.emit("data", "1").await.unwrap();
        engine
            .tracker()
            .enslave(&process, ProcessState::FinalizerInProgress, "to_hash", Value::Null)
            .await
            .unwrap();
        let job = engine.queue().reserve().await.unwrap().unwrap();
        perform(&engine, &job).await.unwrap();

        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::Complete);
        assert_eq!(engine.queue().size().await.unwrap(), 0);
        assert_eq!(process.decode("data").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_duplicate_reduce_is_idempotent() {
        let (engine, mut process) = setup().await;
        process
            .update(ProcessUpdate::default().state(ProcessState::ReduceInProgress))
            .await
            .unwrap();
        process.emit_intermediate("data", "1").await.unwrap();
        process.emit_intermediate("other", "1").await.unwrap();
        let tracker = engine.tracker();
        let stage = ProcessState::ReduceInProgress;
        tracker.enslave(&process, stage, "adder", json!("data")).await.unwrap();
        tracker.enslave(&process, stage, "adder", json!("other")).await.unwrap();

        let job = Job::new("adder", vec![json!(process.pid().as_str()), json!("data")]);
        perform(&engine, &job).await.unwrap();
        perform(&engine, &job).await.unwrap();

        // The duplicate consumed the marker of "other", so the stage advanced
        // and only one reduced value exists for "data"
        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::FinalizerInProgress);
        assert_eq!(process.reduce_values("data").await.unwrap(), ["1"]);
    }

    #[tokio::test]
    async fn test_empty_input_reaches_finalizer() {
        let (engine, mut process) = setup().await;
        engine.store().set("empty", "   ").await.unwrap();
        process.run("empty", false).await.unwrap();

        let job = engine.queue().reserve().await.unwrap().unwrap();
        perform(&engine, &job).await.unwrap();

        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::FinalizerInProgress);
        let job = engine.queue().reserve().await.unwrap().unwrap();
        assert_eq!(job.worker, "to_hash");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_jobs() {
        let (engine, process) = setup().await;
        let pid = json!(process.pid().as_str());

        let err = perform(&engine, &Job::new("WordCounter", vec![pid.clone(), json!(0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownWorker(_)));

        let err = perform(&engine, &Job::new("word_counter", vec![pid.clone(), json!("zero")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedJob { .. }));

        let err = perform(&engine, &Job::new("adder", vec![json!("gone"), json!("k")]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_unit_keeps_marker() {
        let (engine, mut process) = setup().await;
        process
            .update(ProcessUpdate::default().state(ProcessState::ReduceInProgress))
            .await
            .unwrap();
        process.emit_intermediate("data", "not a number").await.unwrap();
        engine
            .tracker()
            .enslave(&process, ProcessState::ReduceInProgress, "adder", json!("data"))
            .await
            .unwrap();
        let job = engine.queue().reserve().await.unwrap().unwrap();

        let err = perform(&engine, &job).await.unwrap_err();
        assert!(matches!(err, Error::StageFailed { .. }));
        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::ReduceInProgress);
        assert_eq!(process.slaves().await.unwrap(), ["1"]);
    }

    #[tokio::test]
    async fn test_stale_map_units_leave_reduce_alone() {
        let (engine, mut process) = setup().await;
        process
            .update(ProcessUpdate::default().state(ProcessState::ReduceInProgress))
            .await
            .unwrap();
        process.emit_intermediate("data", "1").await.unwrap();
        let tracker = engine.tracker();
        tracker
            .enslave(&process, ProcessState::ReduceInProgress, "adder", json!("data"))
            .await
            .unwrap();
        let adder = engine.queue().reserve().await.unwrap().unwrap();

        // Redeliveries of the inputter and a mapper after map has closed
        let pid = json!(process.pid().as_str());
        perform(&engine, &Job::new("word_stream", vec![pid.clone(), json!("wordstream:test")]))
            .await
            .unwrap();
        perform(&engine, &Job::new("word_counter", vec![pid, json!(0)]))
            .await
            .unwrap();

        assert_eq!(engine.queue().size().await.unwrap(), 0);
        let pid = process.pid();
        assert_eq!(
            tracker.outstanding(pid, ProcessState::InputMapInProgress).await.unwrap(),
            0
        );
        assert_eq!(
            tracker.outstanding(pid, ProcessState::ReduceInProgress).await.unwrap(),
            1
        );
        assert_eq!(process.map_values("data").await.unwrap(), ["1"]);

        perform(&engine, &adder).await.unwrap();
        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::FinalizerInProgress);
    }

    #[tokio::test]
    async fn test_retry_resumes_failed_advance() {
        let (engine, store, mut process) = faulty_setup().await;
        let inputter = engine.queue().reserve().await.unwrap().unwrap();
        perform(&engine, &inputter).await.unwrap();
        let mapper = engine.queue().reserve().await.unwrap().unwrap();

        // The last mapper empties the stage, then cannot write the new state
        store.fail("compare_and_set", 1);
        let err = perform(&engine, &mapper).await.unwrap_err();
        assert!(err.is_recoverable());
        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::InputMapInProgress);
        assert!(engine
            .tracker()
            .hold_pending(process.pid(), ProcessState::ReduceInProgress)
            .await
            .unwrap());

        // The retry finishes the handoff without mapping the chunk again
        perform(&engine, &mapper).await.unwrap();
        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::ReduceInProgress);
        assert_eq!(process.map_values("data").await.unwrap(), ["1"]);
        let jobs = engine.queue().peek(0, None).await.unwrap();
        assert_eq!(
            peek_json(&jobs),
            json!([{"worker": "adder", "args": [process.pid().as_str(), "data"]}])
        );

        Worker::new(engine.clone()).work_off().await.unwrap();
        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::Complete);
        assert_eq!(process.decode("data").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_worker_retry_resumes_failed_dispatch() {
        let (engine, store, mut process) = faulty_setup().await;

        // Reduce is entered, but listing the keys to dispatch fails once
        store.fail("set_members", 1);
        Worker::new(engine.clone()).work_off().await.unwrap();

        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::Complete);
        assert_eq!(process.reduce_values("data").await.unwrap(), ["1"]);
        assert_eq!(process.decode("data").await.unwrap().as_deref(), Some("1"));
        for stage in ProcessState::ALL {
            assert_eq!(
                engine.tracker().outstanding(process.pid(), stage).await.unwrap(),
                0
            );
        }
    }

    #[tokio::test]
    async fn test_worker_retry_resumes_failed_release() {
        let (engine, store, mut process) = faulty_setup().await;

        // The mapper's completion succeeds; releasing the hold on reduce after
        // dispatching the reducer does not. The reducer runs before the retry.
        store.fail_later("list_remove_check", 2, 1);
        Worker::new(engine.clone()).work_off().await.unwrap();

        process.reload().await.unwrap();
        assert_eq!(process.state(), ProcessState::Complete);
        assert_eq!(process.reduce_values("data").await.unwrap(), ["1"]);
        assert_eq!(process.decode("data").await.unwrap().as_deref(), Some("1"));
    }
}

//! # mapstage
//!
//! A MapReduce engine driven through a shared work queue and key-value store.
//!
//! A process runs a fixed pipeline of pluggable stages:
//!
//! ```text
//! NOT_STARTED -> INPUT_MAP_IN_PROGRESS -> REDUCE_IN_PROGRESS
//!             -> FINALIZER_IN_PROGRESS -> COMPLETE
//! ```
//!
//! Units of each stage are dispatched as queue jobs and may run on any number
//! of workers, in any order, more than once. Completion is counted with
//! atomic store primitives, so exactly one unit observes the end of a stage
//! and dispatches the next one.
//!
//! ## Usage
//!
//! ```no_run
//! use mapstage::{Engine, ProcessSpecification, StageRegistry};
//!
//! # async fn example() -> mapstage::Result<()> {
//! let engine = Engine::in_memory(StageRegistry::with_builtins());
//! engine.store().set("input", "the quick brown fox").await?;
//!
//! let spec = ProcessSpecification::builder()
//!     .inputter("word_stream")
//!     .mapper("word_counter")
//!     .reducer("adder")
//!     .finalizer("to_hash")
//!     .outputter("hash_outputter")
//!     .build()?;
//! let mut process = engine.create_process(spec).await?;
//! process.run("input", true).await?;
//! assert_eq!(process.decode("fox").await?.as_deref(), Some("1"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - `app` - Logging and startup for the `mapstage` binary
//! - `config` - Engine configuration from TOML and the environment
//! - `coordination` - Completion tracking, stage drivers and the worker loop
//! - `engine` - The shared context processes and workers run against
//! - `process` - Process records, lifecycle state and intermediate tables
//! - `stages` - Pluggable stage contracts, registry and built-in stages
//! - `storage` - Store and queue adapters with memory and Redis backends
//! - `support` - Named per-owner processes for application objects

pub mod app;
pub mod config;
pub mod coordination;
pub mod engine;
pub mod error;
pub mod process;
pub mod stages;
pub mod storage;
pub mod support;

pub use config::{EngineConfig, ReducePolicy, WorkerConfig};
pub use coordination::{Worker, WorkerTracker};
pub use engine::Engine;
pub use error::{Error, Result};
pub use process::{
    Process, ProcessId, ProcessSpecification, ProcessState, ProcessStatus, ProcessUpdate,
};
pub use stages::{StageError, StageRegistry};
pub use support::Support;

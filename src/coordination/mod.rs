//! Work dispatch and stage completion
//!
//! - [`WorkerTracker`] counts outstanding units per (process, stage)
//! - [`drivers`] run one queued unit and advance the pipeline
//! - [`Worker`] pulls units off the queue, inline or in a polling loop

pub mod drivers;
pub mod tracker;
pub mod worker;

pub use tracker::WorkerTracker;
pub use worker::Worker;

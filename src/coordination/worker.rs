//! Worker loop
//!
//! Reserves jobs from the engine's queue and runs them through the stage
//! drivers. Recoverable failures are re-enqueued with an incremented attempt
//! count until the configured limit; anything else is logged and dropped,
//! leaving the unit's marker in place.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::drivers;
use crate::config::WorkerConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::storage::Job;

/// Executes queued units against one engine
#[derive(Clone)]
pub struct Worker {
    engine: Engine,
    config: WorkerConfig,
}

impl Worker {
    /// Worker using the engine's worker configuration
    pub fn new(engine: Engine) -> Self {
        let config = engine.config().worker.clone();
        Self { engine, config }
    }

    pub fn with_config(engine: Engine, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    /// Run one job; recoverable failures are re-enqueued, others returned
    async fn handle(&self, job: Job) -> Result<()> {
        let err = match drivers::perform(&self.engine, &job).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if err.is_recoverable() && job.attempts < self.config.max_retries {
            let retry = job.retried();
            warn!(
                "{} failed for process {} (attempt {}/{}), re-enqueueing: {}",
                job.worker,
                job.pid().unwrap_or("?"),
                retry.attempts,
                self.config.max_retries,
                err
            );
            self.engine.queue().enqueue(retry).await?;
            return Ok(());
        }
        Err(err)
    }

    /// Reserve and run one job; false if the queue was empty
    ///
    /// Job failures are logged, not returned; only queue errors are.
    pub async fn work_one(&self) -> Result<bool> {
        let Some(job) = self.engine.queue().reserve().await? else {
            return Ok(false);
        };
        let worker = job.worker.clone();
        let pid = job.pid().unwrap_or("?").to_string();
        if let Err(e) = self.handle(job).await {
            error!("{} failed for process {}: {}", worker, pid, e);
        }
        Ok(true)
    }

    /// Run jobs until the queue is empty; returns how many were reserved
    pub async fn work_off(&self) -> Result<usize> {
        let mut count = 0;
        while self.work_one().await? {
            count += 1;
        }
        Ok(count)
    }

    /// Like [`Worker::work_off`], but stop at the first failed unit
    pub async fn drain(&self) -> Result<usize> {
        let mut count = 0;
        while let Some(job) = self.engine.queue().reserve().await? {
            self.handle(job).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Poll the queue with `concurrency` tasks until `shutdown` turns true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting {} worker task(s), polling every {:?}",
            self.config.concurrency, self.config.poll_interval
        );

        let mut handles = Vec::new();
        for id in 0..self.config.concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.poll(id, shutdown).await }));
        }

        let mut result = Ok(());
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Worker task stopped: {}", e);
                    result = Err(e);
                }
                Err(e) => error!("Worker task panicked: {}", e),
            }
        }
        info!("Workers stopped");
        result
    }

    async fn poll(&self, id: usize, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let idle = self.config.poll_interval;
        loop {
            if *shutdown.borrow() {
                debug!("Worker task {} shutting down", id);
                return Ok(());
            }
            match self.work_one().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) if e.is_recoverable() => {
                    warn!("Worker task {} could not reserve a job: {}", id, e);
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = tokio::time::sleep(idle.max(Duration::from_millis(1))) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

//! The single consumer of the generator pipeline.
//!
//! [`run_pipeline`] builds everything in dependency order (counters, slots,
//! allocator threads, worker threads), drains records on the calling thread
//! until the target count is persisted, then tears everything down in the
//! reverse order.

use super::{
    allocator::IdAllocator,
    counter::SharedCounterState,
    slot::SlotRegistry,
    worker::{GeneratorWorker, RecordSource, WorkerReport},
};
use crate::{
    error::{Error, Result},
    metrics,
    store::RecordStore,
    sync::DEFAULT_POLL_INTERVAL,
};
use core::time::Duration;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

/// IDs handed to a worker per allocation request unless configured otherwise.
pub const DEFAULT_BATCH: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub workers: usize,
    pub total_records: u64,
    pub batch: u64,
    /// Upper bound on how long a blocked thread goes without checking for
    /// cancellation.
    pub poll_interval: Duration,
}

impl PipelineConfig {
    pub const fn new(workers: usize, total_records: u64) -> Self {
        Self {
            workers,
            total_records,
            batch: DEFAULT_BATCH,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_batch(mut self, batch: u64) -> Self {
        self.batch = batch;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any count is zero.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.workers == 0 {
            "worker count must be greater than zero"
        } else if self.total_records == 0 {
            "total records must be greater than zero"
        } else if self.batch == 0 {
            "batch size must be greater than zero"
        } else if self.poll_interval.is_zero() {
            "poll interval must be greater than zero"
        } else {
            return Ok(());
        };
        Err(Error::InvalidConfig {
            reason: reason.to_string(),
        })
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub total: u64,
    pub written: u64,
    /// `true` if a termination request stopped the run early.
    pub cancelled: bool,
    /// One entry per worker, in worker index order.
    pub workers: Vec<WorkerReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    Draining,
    Done,
}

/// Drains full slots into the durable store.
pub struct Coordinator<S> {
    store: S,
    counters: Arc<SharedCounterState>,
    slots: Arc<SlotRegistry>,
    cursor: usize,
    state: CoordinatorState,
}

impl<S: RecordStore> Coordinator<S> {
    pub fn new(store: S, counters: Arc<SharedCounterState>, slots: Arc<SlotRegistry>) -> Self {
        Self {
            store,
            counters,
            slots,
            cursor: 0,
            state: CoordinatorState::Running,
        }
    }

    pub const fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Persists one record per `items_ready` signal until the written count
    /// reaches the target, then moves to [`CoordinatorState::Draining`].
    ///
    /// Each scan resumes at the slot after the one drained last, so a busy
    /// low-index worker can't starve the others.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] on a termination request.
    /// - [`Error::InvariantBreach`] if the slot protocol is violated or the
    ///   coordinator has already drained.
    /// - [`Error::Io`] if the store can't be written.
    ///
    /// The coordinator is in the draining state on return either way.
    pub fn drain(&mut self, cancel: &CancellationToken) -> Result<u64> {
        if self.state != CoordinatorState::Running {
            return Err(Error::InvariantBreach(format!(
                "coordinator asked to drain while {:?}",
                self.state
            )));
        }
        let result = self.drain_until_complete(cancel);
        self.state = CoordinatorState::Draining;
        result
    }

    fn drain_until_complete(&mut self, cancel: &CancellationToken) -> Result<u64> {
        let total = self.counters.total();
        let mut written = self.counters.written();

        while written < total {
            let (idx, record) = self.slots.drain_one(self.cursor, cancel)?;
            self.store.append_record(&record)?;
            written = self.counters.record_written();
            metrics::increment_records_written(1);
            self.cursor = (idx + 1) % self.slots.len();
            tracing::trace!("Persisted ID {} from slot {idx} ({written}/{total})", record.id);
        }

        tracing::debug!("All {total} records persisted");
        Ok(written)
    }

    /// Flushes and closes the store.
    ///
    /// # Errors
    ///
    /// - [`Error::InvariantBreach`] if called before [`Coordinator::drain`].
    /// - [`Error::Io`] if the final flush fails.
    pub fn finish(mut self) -> Result<()> {
        if self.state != CoordinatorState::Draining {
            return Err(Error::InvariantBreach(format!(
                "coordinator finished while {:?}",
                self.state
            )));
        }
        self.store.flush()?;
        self.state = CoordinatorState::Done;
        tracing::debug!("Coordinator {:?}", self.state);
        Ok(())
    }
}

type WorkerThread = JoinHandle<Result<WorkerReport>>;

/// Runs the generator pipeline to completion.
///
/// `make_source` is called once per worker index to build that worker's
/// [`RecordSource`]. The store's header is written before any worker starts.
///
/// A termination request through `cancel` stops every thread at its next
/// blocking point; the run then returns `Ok` with
/// [`PipelineReport::cancelled`] set and whatever was persisted so far.
///
/// # Errors
///
/// - [`Error::InvalidConfig`] if `config` doesn't validate.
/// - [`Error::Io`] if the store fails or a thread can't be spawned.
/// - [`Error::InvariantBreach`] if any component detects a protocol
///   violation or a thread panicked.
///
/// Every spawned thread has been joined by the time this returns.
pub fn run_pipeline<S, R, F>(
    config: &PipelineConfig,
    mut store: S,
    mut make_source: F,
    cancel: &CancellationToken,
) -> Result<PipelineReport>
where
    S: RecordStore,
    R: RecordSource + 'static,
    F: FnMut(usize) -> R,
{
    config.validate()?;
    tracing::info!(
        "Starting pipeline: {} workers, {} records, batch {}",
        config.workers,
        config.total_records,
        config.batch
    );

    store.append_header()?;

    // Fatal errors stop the pipeline through this token without touching the
    // caller's.
    let stop = cancel.child_token();
    let counters = Arc::new(SharedCounterState::new(config.total_records));
    let slots = Arc::new(SlotRegistry::new(config.workers, config.poll_interval));
    let (allocator, handles) =
        IdAllocator::spawn(&counters, config.workers, config.batch, config.poll_interval)?;

    let mut workers: Vec<WorkerThread> = Vec::with_capacity(config.workers);
    for handle in handles {
        let worker_id = handle.worker_id();
        let worker = GeneratorWorker::new(
            handle,
            Arc::clone(&slots),
            make_source(worker_id),
            stop.clone(),
        );
        let worker_stop = stop.clone();
        let spawned = thread::Builder::new()
            .name(format!("generator-{worker_id}"))
            .spawn(move || {
                let result = worker.run();
                if result.is_err() {
                    worker_stop.cancel();
                }
                result
            });

        match spawned {
            Ok(thread) => workers.push(thread),
            Err(e) => {
                tracing::error!("Failed to spawn worker {worker_id}: {e}");
                stop.cancel();
                let _ = join_workers(workers);
                allocator.join()?;
                return Err(e.into());
            }
        }
    }

    let mut coordinator = Coordinator::new(store, Arc::clone(&counters), slots);
    let drained = coordinator.drain(&stop);
    if drained.is_err() {
        stop.cancel();
    }

    // Workers retire on their own once they see an exhausted grant, so they
    // are joined before the allocator threads are woken.
    let joined = join_workers(workers);
    allocator.join()?;
    coordinator.finish()?;

    let (cancelled, reports) = match (drained, joined) {
        (_, Err(e)) => return Err(e),
        (Ok(_), Ok(reports)) => (false, reports),
        (Err(Error::Cancelled), Ok(reports)) if cancel.is_cancelled() => {
            tracing::info!("Pipeline cancelled");
            (true, reports)
        }
        (Err(Error::Cancelled), Ok(_)) => {
            return Err(Error::InvariantBreach(
                "pipeline stopped before reaching its target".to_string(),
            ));
        }
        (Err(e), Ok(_)) => return Err(e),
    };

    let report = PipelineReport {
        total: counters.total(),
        written: counters.written(),
        cancelled,
        workers: reports,
    };
    tracing::info!("Pipeline finished: {}/{} records written", report.written, report.total);
    Ok(report)
}

/// Joins every worker, returning the first failure after all have exited.
fn join_workers(workers: Vec<WorkerThread>) -> Result<Vec<WorkerReport>> {
    let mut reports = Vec::with_capacity(workers.len());
    let mut first_error = None;

    for (worker_id, thread) in workers.into_iter().enumerate() {
        let outcome = thread
            .join()
            .unwrap_or_else(|_| Err(Error::InvariantBreach(format!("worker {worker_id} panicked"))));
        match outcome {
            Ok(report) => reports.push(report),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

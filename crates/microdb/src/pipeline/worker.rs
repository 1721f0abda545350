use super::{allocator::AllocatorHandle, slot::SlotRegistry};
use crate::{
    error::{Error, Result},
    record::Record,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const FRUITS: [&str; 5] = ["Apple", "Pear", "Orange", "Banana", "Kiwi"];
const COLORS: [&str; 5] = ["Red", "Green", "Yellow", "Blue", "Black"];

/// Synthesizes the payload for a granted ID.
pub trait RecordSource: Send {
    fn synthesize(&mut self, id: u64) -> Record;
}

impl<F> RecordSource for F
where
    F: FnMut(u64) -> Record + Send,
{
    fn synthesize(&mut self, id: u64) -> Record {
        self(id)
    }
}

/// Default [`RecordSource`]: a random fruit, colour and number per ID.
///
/// Each worker owns an independently seeded generator.
pub struct RandomInventory {
    rng: StdRng,
}

impl RandomInventory {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSource for RandomInventory {
    fn synthesize(&mut self, id: u64) -> Record {
        let fruit = FRUITS[self.rng.random_range(0..FRUITS.len())];
        let color = COLORS[self.rng.random_range(0..COLORS.len())];
        let number = self.rng.random_range(0..1000_u32).to_string();
        Record::new(id, [fruit, color, number.as_str()])
    }
}

/// What a worker did before it retired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub blocks: usize,
    pub produced: u64,
    /// Every ID the worker was granted, in grant order.
    pub granted: Vec<core::ops::Range<u64>>,
}

/// Requests ID blocks and pushes one synthesized record per ID through its
/// slot.
pub struct GeneratorWorker<S> {
    allocator: AllocatorHandle,
    slots: Arc<SlotRegistry>,
    source: S,
    cancel: CancellationToken,
}

impl<S: RecordSource> GeneratorWorker<S> {
    pub fn new(
        allocator: AllocatorHandle,
        slots: Arc<SlotRegistry>,
        source: S,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            allocator,
            slots,
            source,
            cancel,
        }
    }

    /// Runs until the allocator hands out an exhausted grant or a
    /// termination request is observed.
    ///
    /// Each pass of the loop requests one block, then produces every ID in
    /// it; an exhausted grant ends the worker.
    ///
    /// Cancellation is checked between records; an in-flight handoff is
    /// allowed to finish but no new one is started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantBreach`] if the slot protocol is violated,
    /// or [`Error::ChannelClosed`] if the allocator disappears while the
    /// pipeline is still running.
    pub fn run(mut self) -> Result<WorkerReport> {
        let worker_id = self.allocator.worker_id();
        let mut report = WorkerReport {
            worker_id,
            ..WorkerReport::default()
        };
        tracing::debug!("Worker {worker_id} started");

        let result = self.produce(&mut report);

        match result {
            Ok(()) | Err(Error::Cancelled) => {
                tracing::debug!(
                    "Worker {worker_id} done: {} records in {} blocks",
                    report.produced,
                    report.blocks
                );
                Ok(report)
            }
            Err(Error::ChannelClosed { .. }) if self.cancel.is_cancelled() => Ok(report),
            Err(e) => {
                tracing::error!("Worker {worker_id} failed: {e}");
                Err(e)
            }
        }
    }

    fn produce(&mut self, report: &mut WorkerReport) -> Result<()> {
        let worker_id = report.worker_id;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let grant = self.allocator.request_block(&self.cancel)?;
            if grant.is_exhausted() {
                return Ok(());
            }

            report.blocks += 1;
            report.granted.push(grant.ids());
            tracing::trace!("Worker {worker_id} producing {:?}", grant.ids());

            for id in grant.ids() {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let record = self.source.synthesize(id);
                self.slots.push(worker_id, record, &self.cancel)?;
                report.produced += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_inventory_draws_from_known_values() {
        let mut source = RandomInventory::seeded(7);
        for id in 1..50 {
            let record = source.synthesize(id);
            assert_eq!(record.id, id);
            assert_eq!(record.fields.len(), 3);
            assert!(FRUITS.contains(&record.fields[0].as_str()));
            assert!(COLORS.contains(&record.fields[1].as_str()));
            assert!(record.fields[2].parse::<u32>().unwrap() < 1000);
        }
    }

    #[test]
    fn closures_are_record_sources() {
        let mut source = |id: u64| Record::new(id, ["x"]);
        assert_eq!(source.synthesize(3), Record::new(3, ["x"]));
    }
}

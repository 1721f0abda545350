use crate::{
    error::{Error, Result},
    pipeline::{
        Coordinator, CoordinatorState, PipelineConfig, RandomInventory, SharedCounterState,
        SlotRegistry, run_pipeline,
    },
    record::{Record, Schema},
    store::{CsvStore, RecordStore},
};
use core::time::Duration;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(5);

/// In-memory store whose rows stay inspectable after the pipeline consumes
/// it.
#[derive(Clone)]
struct MemoryStore {
    schema: Schema,
    rows: Arc<Mutex<Vec<Record>>>,
    headers: Arc<Mutex<usize>>,
    fail_after: Option<usize>,
    cancel_at: Option<(usize, CancellationToken)>,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            schema: Schema::generated(),
            rows: Arc::default(),
            headers: Arc::default(),
            fail_after: None,
            cancel_at: None,
        }
    }

    fn failing_after(rows: usize) -> Self {
        Self {
            fail_after: Some(rows),
            ..Self::new()
        }
    }

    /// Cancels `token` right after the `rows`-th record is stored.
    fn cancelling_at(rows: usize, token: CancellationToken) -> Self {
        Self {
            cancel_at: Some((rows, token)),
            ..Self::new()
        }
    }

    fn ids(&self) -> Vec<u64> {
        self.rows.lock().iter().map(|r| r.id).collect()
    }
}

impl RecordStore for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn append_header(&mut self) -> Result<()> {
        *self.headers.lock() += 1;
        Ok(())
    }

    fn append_record(&mut self, record: &Record) -> Result<()> {
        let mut rows = self.rows.lock();
        if self.fail_after.is_some_and(|limit| rows.len() >= limit) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        rows.push(record.clone());
        if let Some((at, token)) = &self.cancel_at {
            if rows.len() == *at {
                token.cancel();
            }
        }
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Record>> {
        Ok(self.rows.lock().clone())
    }

    fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        *self.rows.lock() = records.to_vec();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn run_covers_every_id_exactly_once(workers: usize, total: u64, batch: u64) {
    let store = MemoryStore::new();
    let config = PipelineConfig::new(workers, total)
        .with_batch(batch)
        .with_poll_interval(POLL);

    let report = run_pipeline(
        &config,
        store.clone(),
        |i| RandomInventory::seeded(i as u64),
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.written, total);
    assert_eq!(report.workers.len(), workers);
    assert_eq!(*store.headers.lock(), 1);

    let mut ids = store.ids();
    ids.sort_unstable();
    assert_eq!(ids, (1..=total).collect::<Vec<_>>());

    let produced: u64 = report.workers.iter().map(|w| w.produced).sum();
    assert_eq!(produced, total);
}

#[test]
fn three_workers_thirty_records_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("generated.csv");
    let store = CsvStore::create(&path, Schema::generated()).unwrap();
    let config = PipelineConfig::new(3, 30).with_poll_interval(POLL);

    let report = run_pipeline(
        &config,
        store,
        |_| RandomInventory::new(),
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(report.written, 30);

    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("ID,Fruit,Color,Number"));

    let mut ids: Vec<u64> = lines
        .map(|line| line.split(',').next().unwrap().parse().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=30).collect::<Vec<_>>());
}

#[test]
fn single_worker_single_record() {
    run_covers_every_id_exactly_once(1, 1, 10);
}

#[test]
fn more_workers_than_records() {
    run_covers_every_id_exactly_once(8, 3, 10);
}

#[test]
fn batch_of_one() {
    run_covers_every_id_exactly_once(4, 50, 1);
}

#[test]
fn rejects_empty_configurations() {
    for config in [
        PipelineConfig::new(0, 10),
        PipelineConfig::new(2, 0),
        PipelineConfig::new(2, 10).with_batch(0),
    ] {
        let err = run_pipeline(
            &config,
            MemoryStore::new(),
            |_| RandomInventory::new(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}

#[test]
fn cancellation_stops_a_run_early() {
    let store = MemoryStore::new();
    let config = PipelineConfig::new(4, 1_000_000).with_poll_interval(POLL);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        })
    };

    let slow_source = |_| {
        |id: u64| {
            thread::sleep(Duration::from_millis(1));
            Record::new(id, ["Kiwi", "Green", "1"])
        }
    };
    let report = run_pipeline(&config, store.clone(), slow_source, &cancel).unwrap();
    canceller.join().unwrap();

    assert!(report.cancelled);
    assert!(report.written < report.total);
    assert_eq!(report.written as usize, store.ids().len());

    let unique: HashSet<u64> = store.ids().into_iter().collect();
    assert_eq!(unique.len(), store.ids().len());
}

#[test]
fn cancelling_after_the_last_record_is_a_complete_run() {
    let cancel = CancellationToken::new();
    let store = MemoryStore::cancelling_at(20, cancel.clone());
    let config = PipelineConfig::new(3, 20).with_poll_interval(POLL);

    let report = run_pipeline(
        &config,
        store.clone(),
        |i| RandomInventory::seeded(i as u64),
        &cancel,
    )
    .unwrap();

    assert!(cancel.is_cancelled());
    assert!(!report.cancelled);
    assert_eq!(report.written, 20);
    assert_eq!(store.ids().len(), 20);
}

#[test]
fn coordinator_drains_once_then_finishes() {
    let counters = Arc::new(SharedCounterState::new(2));
    let slots = Arc::new(SlotRegistry::new(1, POLL));
    let store = MemoryStore::new();
    let cancel = CancellationToken::new();

    let mut coordinator = Coordinator::new(store.clone(), Arc::clone(&counters), Arc::clone(&slots));
    assert_eq!(coordinator.state(), CoordinatorState::Running);

    let producer = {
        let slots = Arc::clone(&slots);
        let cancel = cancel.clone();
        thread::spawn(move || {
            for id in 1..=2 {
                slots
                    .push(0, Record::new(id, ["Kiwi", "Green", "1"]), &cancel)
                    .unwrap();
            }
        })
    };

    assert_eq!(coordinator.drain(&cancel).unwrap(), 2);
    producer.join().unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Draining);
    assert_eq!(store.ids(), [1, 2]);

    assert!(matches!(
        coordinator.drain(&cancel),
        Err(Error::InvariantBreach(_))
    ));
    coordinator.finish().unwrap();
}

#[test]
fn coordinator_cannot_finish_before_draining() {
    let coordinator = Coordinator::new(
        MemoryStore::new(),
        Arc::new(SharedCounterState::new(1)),
        Arc::new(SlotRegistry::new(1, POLL)),
    );
    assert!(matches!(
        coordinator.finish(),
        Err(Error::InvariantBreach(_))
    ));
}

#[test]
fn store_failure_stops_every_thread() {
    let store = MemoryStore::failing_after(5);
    let config = PipelineConfig::new(3, 500).with_poll_interval(POLL);

    let err = run_pipeline(
        &config,
        store.clone(),
        |i| RandomInventory::seeded(i as u64),
        &CancellationToken::new(),
    )
    .unwrap_err();

    assert!(matches!(err, Error::Io(_)));
    assert_eq!(store.ids().len(), 5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn grants_are_disjoint_and_exhaustive(
        workers in 1_usize..6,
        total in 1_u64..300,
        batch in 1_u64..16,
    ) {
        let store = MemoryStore::new();
        let config = PipelineConfig::new(workers, total)
            .with_batch(batch)
            .with_poll_interval(POLL);

        let report = run_pipeline(
            &config,
            store.clone(),
            |i| RandomInventory::seeded(i as u64),
            &CancellationToken::new(),
        )
        .unwrap();

        let mut granted = HashSet::new();
        for worker in &report.workers {
            for range in &worker.granted {
                prop_assert!(range.end - range.start <= batch);
                for id in range.clone() {
                    prop_assert!(granted.insert(id), "ID {} granted twice", id);
                }
            }
        }
        prop_assert_eq!(granted.len() as u64, total);

        let persisted: HashSet<u64> = store.ids().into_iter().collect();
        prop_assert_eq!(persisted, granted);
        prop_assert_eq!(store.ids().len() as u64, total);
    }
}

//! Capacity-1 handoff slots between generator workers and the coordinator.
//!
//! Each worker owns one [`ChannelSlot`]. A slot has its own `empty` signal and
//! exclusion lock, so two workers never contend on each other's slot. A
//! single `items_ready` signal, shared by all slots, tells the coordinator
//! that *some* slot is full; the coordinator scans to find which.
//!
//! Only a worker moves its slot from empty to full and only the coordinator
//! moves it back, so each `items_ready` permit corresponds to exactly one
//! full slot at scan time.

use crate::{
    error::{Error, Result},
    record::Record,
    sync::Semaphore,
};
use core::time::Duration;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct SlotState {
    full: bool,
    payload: Option<Record>,
}

/// One worker's single-item mailbox.
pub struct ChannelSlot {
    state: Mutex<SlotState>,
    empty: Semaphore,
}

impl ChannelSlot {
    fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            empty: Semaphore::with_poll_interval(1, poll_interval),
        }
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }
}

/// All slots plus the shared `items_ready` counter, indexed by worker.
pub struct SlotRegistry {
    slots: Vec<ChannelSlot>,
    items_ready: Semaphore,
}

impl SlotRegistry {
    pub fn new(workers: usize, poll_interval: Duration) -> Self {
        Self {
            slots: (0..workers)
                .map(|_| ChannelSlot::new(poll_interval))
                .collect(),
            items_ready: Semaphore::with_poll_interval(0, poll_interval),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, worker_id: usize) -> &ChannelSlot {
        &self.slots[worker_id]
    }

    /// Producer side: hands `record` to the coordinator through the worker's
    /// slot, blocking while the previous record hasn't been drained.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fires while waiting for the slot.
    /// - [`Error::InvariantBreach`] if the slot is full despite the `empty`
    ///   permit.
    pub fn push(&self, worker_id: usize, record: Record, cancel: &CancellationToken) -> Result<()> {
        let slot = &self.slots[worker_id];
        slot.empty.acquire(cancel)?;

        {
            let mut state = slot.state.lock();
            if state.full {
                return Err(Error::InvariantBreach(format!(
                    "slot {worker_id} already full on push"
                )));
            }
            state.payload = Some(record);
            state.full = true;
        }

        self.items_ready.release();
        Ok(())
    }

    /// Consumer side: waits for one ready item and drains it.
    ///
    /// The scan starts at `start` and wraps around; exactly one slot is
    /// drained per `items_ready` permit. Returns the drained slot's index
    /// together with its record.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fires while waiting.
    /// - [`Error::InvariantBreach`] if no slot is full after a permit was
    ///   consumed.
    pub fn drain_one(&self, start: usize, cancel: &CancellationToken) -> Result<(usize, Record)> {
        self.items_ready.acquire(cancel)?;

        let n = self.slots.len();
        for offset in 0..n {
            let idx = (start + offset) % n;
            let slot = &self.slots[idx];

            let taken = {
                let mut state = slot.state.lock();
                if state.full {
                    state.full = false;
                    state.payload.take()
                } else {
                    None
                }
            };

            if let Some(record) = taken {
                slot.empty.release();
                return Ok((idx, record));
            }
        }

        Err(Error::InvariantBreach(
            "items_ready signalled but no slot is full".to_string(),
        ))
    }

    /// Simulates a spurious `items_ready` signal.
    #[cfg(test)]
    pub(crate) fn signal_spurious(&self) {
        self.items_ready.release();
    }
}

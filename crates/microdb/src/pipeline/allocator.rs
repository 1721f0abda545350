//! Per-worker ID allocation service.
//!
//! Every worker gets its own service thread. The worker sends a request over
//! a bounded(1) channel and waits for the grant on another; the service
//! thread drains [`SharedCounterState`] and answers. Since a worker only ever
//! has one request outstanding, the service is never re-entered for the same
//! worker.

use super::counter::{AllocationGrant, SharedCounterState};
use crate::error::{Error, Result};
use core::time::Duration;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

/// The worker's end of its allocation service.
pub struct AllocatorHandle {
    worker_id: usize,
    requests: Sender<()>,
    grants: Receiver<AllocationGrant>,
    poll_interval: Duration,
}

impl AllocatorHandle {
    pub const fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Asks for the next block of IDs and blocks until it is granted.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fires while waiting for the grant.
    /// - [`Error::ChannelClosed`] if the service thread has already exited.
    pub fn request_block(&self, cancel: &CancellationToken) -> Result<AllocationGrant> {
        self.requests.send(()).map_err(|_| Error::ChannelClosed {
            context: format!("Allocator {} request channel closed", self.worker_id),
        })?;

        loop {
            match self.grants.recv_timeout(self.poll_interval) {
                Ok(grant) => return Ok(grant),
                Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => {
                    return Err(Error::Cancelled);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::ChannelClosed {
                        context: format!("Allocator {} grant channel closed", self.worker_id),
                    });
                }
            }
        }
    }
}

/// The set of allocation service threads, one per worker.
pub struct IdAllocator {
    threads: Vec<JoinHandle<()>>,
    wake: Option<Sender<()>>,
}

impl IdAllocator {
    /// Spawns one service thread per worker and returns the workers' handles
    /// in index order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a thread can't be spawned.
    pub fn spawn(
        state: &Arc<SharedCounterState>,
        workers: usize,
        max_batch: u64,
        poll_interval: Duration,
    ) -> Result<(Self, Vec<AllocatorHandle>)> {
        // Never sent on; dropping the sender wakes every service thread.
        let (wake_tx, wake_rx) = bounded::<()>(0);
        let mut threads = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (req_tx, req_rx) = bounded(1);
            let (grant_tx, grant_rx) = bounded(1);
            let state = Arc::clone(state);
            let wake_rx = wake_rx.clone();

            let thread = thread::Builder::new()
                .name(format!("allocator-{worker_id}"))
                .spawn(move || serve(worker_id, &state, max_batch, &req_rx, &grant_tx, &wake_rx))?;

            threads.push(thread);
            handles.push(AllocatorHandle {
                worker_id,
                requests: req_tx,
                grants: grant_rx,
                poll_interval,
            });
        }

        Ok((
            Self {
                threads,
                wake: Some(wake_tx),
            },
            handles,
        ))
    }

    /// Wakes every service thread so it can answer any pending request with
    /// an exhausted grant and exit.
    pub fn wake_all(&mut self) {
        self.wake.take();
    }

    /// Wakes and joins every service thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantBreach`] if a service thread panicked.
    pub fn join(mut self) -> Result<()> {
        self.wake_all();
        for (worker_id, thread) in self.threads.drain(..).enumerate() {
            thread.join().map_err(|_| {
                Error::InvariantBreach(format!("allocator {worker_id} panicked"))
            })?;
        }
        Ok(())
    }
}

fn serve(
    worker_id: usize,
    state: &SharedCounterState,
    max_batch: u64,
    requests: &Receiver<()>,
    grants: &Sender<AllocationGrant>,
    wake: &Receiver<()>,
) {
    tracing::trace!("Allocator {worker_id} started");

    loop {
        select! {
            recv(requests) -> msg => {
                if msg.is_err() {
                    tracing::trace!("Allocator {worker_id}: worker hung up");
                    break;
                }
                let grant = state.request_block(max_batch);
                let exhausted = grant.is_exhausted();
                tracing::trace!("Allocator {worker_id} granted {:?}", grant.ids());
                if grants.send(grant).is_err() || exhausted {
                    break;
                }
            }
            recv(wake) -> _ => {
                if requests.try_recv().is_ok() {
                    let _ = grants.send(AllocationGrant::exhausted());
                }
                tracing::trace!("Allocator {worker_id} woken for shutdown");
                break;
            }
        }
    }

    tracing::trace!("Allocator {worker_id} stopped");
}

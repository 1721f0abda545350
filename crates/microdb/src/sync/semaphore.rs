use crate::error::{Error, Result};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

/// How long a blocked waiter sleeps before re-checking its cancellation token.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A counting semaphore for OS threads.
///
/// Waits are bounded by a poll interval: a blocked [`Semaphore::acquire`]
/// wakes up periodically to check its [`CancellationToken`], so a
/// termination request is observed at every blocking point without tearing
/// down the primitive from another context.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
    poll_interval: Duration,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self::with_poll_interval(permits, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(permits: usize, poll_interval: Duration) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
            poll_interval,
        }
    }

    /// Takes one permit, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires while blocked. A permit
    /// that is already available is taken even if `cancel` has fired.
    pub fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.available.wait_for(&mut permits, self.poll_interval);
        }
        *permits -= 1;
        Ok(())
    }

    /// Returns one permit and wakes a single waiter.
    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

//! The store-wide transaction lock.
//!
//! [`SessionLock`] tracks which session holds the transaction, and while it
//! is held it also keeps an exclusive advisory `flock` on the store file so
//! other processes that open the same store observe the transaction too.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use std::{fs::File, path::PathBuf};

/// Identifies one client session for the lifetime of the server.
pub type SessionId = u64;

#[derive(Default)]
struct LockState {
    holder: Option<SessionId>,
    file_lock: Option<Flock<File>>,
}

/// Global exclusive lock: free, or held by exactly one session.
///
/// `holder.is_some()` if and only if the file lock is held. Both change
/// together under one mutex.
pub struct SessionLock {
    path: PathBuf,
    state: Mutex<LockState>,
}

impl SessionLock {
    /// Creates a free lock guarding the store at `path`. The file is opened
    /// on every acquire, so it only has to exist by then.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(LockState::default()),
        }
    }

    /// Takes the lock for `session` without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::TransactionAlreadyActive`] if `session` already holds it.
    /// - [`Error::TransactionBusy`] if another session, or another process
    ///   with the store open, holds it.
    /// - [`Error::Io`] if the store file can't be opened or locked.
    pub fn try_acquire(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        match state.holder {
            Some(holder) if holder == session => return Err(Error::TransactionAlreadyActive),
            Some(_) => return Err(Error::TransactionBusy),
            None => {}
        }

        let file = File::open(&self.path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file_lock) => {
                state.holder = Some(session);
                state.file_lock = Some(file_lock);
                Ok(())
            }
            Err((_, Errno::EAGAIN)) => {
                tracing::debug!("Store {} locked by another process", self.path.display());
                Err(Error::TransactionBusy)
            }
            Err((_, errno)) => Err(Error::Io(errno.into())),
        }
    }

    /// Releases the lock held by `session`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantBreach`] if `session` is not the holder:
    /// either a double release or a release on someone else's behalf.
    pub fn release(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.holder != Some(session) {
            return Err(Error::InvariantBreach(format!(
                "session {session} released a lock held by {:?}",
                state.holder
            )));
        }
        state.holder = None;
        // Dropping the guard unlocks and closes the file.
        state.file_lock = None;
        Ok(())
    }

    /// Releases the lock if `session` holds it. Returns whether it did.
    ///
    /// Used when a session ends without committing.
    pub fn force_release(&self, session: SessionId) -> bool {
        let mut state = self.state.lock();
        if state.holder != Some(session) {
            return false;
        }
        state.holder = None;
        state.file_lock = None;
        true
    }

    pub fn holder(&self) -> Option<SessionId> {
        self.state.lock().holder
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }
}

//! Line-oriented transactional record server.
//!
//! Each admitted connection becomes a [`ClientSession`] task. Sessions share
//! one [`Dispatcher`] (and through it one store) and one [`SessionLock`];
//! BEGIN/COMMIT move the lock between sessions and reads are refused while it
//! is held.

mod admission;
mod command;
mod dispatcher;
mod lock;
mod session;

#[cfg(test)]
mod tests;

pub use admission::*;
pub use command::*;
pub use dispatcher::*;
pub use lock::*;
pub use session::*;

use crate::{
    error::{Error, Result},
    record::Schema,
    store::{CsvStore, RecordStore},
};
use core::time::Duration;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_BACKLOG: u32 = 5;

/// How long the accept loop backs off after a failed `accept`.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub max_concurrent: usize,
    pub backlog: u32,
    pub store_path: PathBuf,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr, store_path: impl Into<PathBuf>) -> Self {
        Self {
            addr,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            backlog: DEFAULT_BACKLOG,
            store_path: store_path.into(),
        }
    }

    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    #[must_use]
    pub const fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no session could ever be admitted.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::InvalidConfig {
                reason: "max concurrent sessions must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "registros_generados.csv",
        )
    }
}

pub struct Server<S> {
    dispatcher: Arc<Dispatcher<S>>,
    lock: Arc<SessionLock>,
    admission: ConnectionAdmission,
}

impl Server<CsvStore> {
    /// Opens (or creates, with the inventory header) the configured CSV
    /// store.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `config` doesn't validate.
    /// - [`Error::Io`] if the store can't be opened.
    pub fn open(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let store = CsvStore::open(&config.store_path, Schema::inventory())?;
        let lock = SessionLock::new(&config.store_path);
        Ok(Self::new(store, lock, config.max_concurrent))
    }
}

impl<S: RecordStore + 'static> Server<S> {
    pub fn new(store: S, lock: SessionLock, max_concurrent: usize) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(store)),
            lock: Arc::new(lock),
            admission: ConnectionAdmission::new(max_concurrent),
        }
    }

    pub const fn session_lock(&self) -> &Arc<SessionLock> {
        &self.lock
    }

    /// Accepts and serves sessions until `shutdown` fires.
    ///
    /// On shutdown the listener is closed first, then every live session is
    /// told to stop and awaited; any transaction still open is released as
    /// its session drops.
    ///
    /// # Errors
    ///
    /// Returns an error only if the admission gate itself breaks.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                "Serving on {addr} (max {} concurrent sessions)",
                self.admission.max_concurrent()
            );
        }

        let tracker = TaskTracker::new();
        let mut next_user: SessionId = 0;

        loop {
            let permit = match self.admission.admit(&shutdown).await {
                Ok(permit) => permit,
                Err(Error::Cancelled) => break,
                Err(e) => return Err(e),
            };

            let (stream, peer) = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            next_user += 1;
            tracing::info!("User {next_user} connected from {peer}");
            let session = ClientSession::new(next_user, Arc::clone(&self.lock));
            tracker.spawn(run_session(
                stream,
                session,
                Arc::clone(&self.dispatcher),
                permit,
                shutdown.clone(),
            ));
        }

        drop(listener);
        tracing::info!("Waiting for {} live sessions", tracker.len());
        tracker.close();
        tracker.wait().await;

        tracing::info!("Server stopped");
        Ok(())
    }
}

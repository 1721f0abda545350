//! Bounded admission of client sessions.
//!
//! At most `max_concurrent` sessions run at once. The accept loop takes a
//! permit *before* accepting, so further clients wait in the kernel's listen
//! queue (sized by `backlog`) rather than being turned away; clients beyond
//! the backlog are refused by the transport.

use crate::{
    error::{Error, Result},
    metrics,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    net::{TcpListener, TcpSocket},
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;

/// Held by a running session; dropping it frees a slot and wakes the accept
/// loop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        metrics::session_opened();
        Self { _permit: permit }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        metrics::session_closed();
    }
}

pub struct ConnectionAdmission {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConnectionAdmission {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Sessions that could still be admitted right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free session slot.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if `shutdown` fires first.
    pub async fn admit(&self, shutdown: &CancellationToken) -> Result<AdmissionPermit> {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => Err(Error::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                let permit = permit.map_err(|_| Error::ChannelClosed {
                    context: "admission gate closed".to_string(),
                })?;
                Ok(AdmissionPermit::new(permit))
            }
        }
    }
}

/// Binds a listener with an explicit listen backlog.
///
/// # Errors
///
/// Returns [`Error::Io`] if the socket can't be created, bound or put in
/// listening mode.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn blocks_beyond_capacity_until_a_permit_drops() {
        let admission = ConnectionAdmission::new(2);
        let shutdown = CancellationToken::new();

        let first = admission.admit(&shutdown).await.unwrap();
        let _second = admission.admit(&shutdown).await.unwrap();
        assert_eq!(admission.available(), 0);

        let waiting = timeout(Duration::from_millis(50), admission.admit(&shutdown)).await;
        assert!(waiting.is_err());

        drop(first);
        let third = timeout(Duration::from_secs(1), admission.admit(&shutdown)).await;
        assert!(third.unwrap().is_ok());
    }

    #[tokio::test]
    async fn shutdown_wakes_a_blocked_admit() {
        let admission = ConnectionAdmission::new(1);
        let shutdown = CancellationToken::new();
        let _held = admission.admit(&shutdown).await.unwrap();

        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                shutdown.cancel();
            })
        };

        let result = timeout(Duration::from_secs(1), admission.admit(&shutdown))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}

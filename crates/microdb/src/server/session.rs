use super::{
    admission::AdmissionPermit,
    command::Command,
    dispatcher::{Dispatcher, Reply},
    lock::{SessionId, SessionLock},
};
use crate::{
    error::{Error, Result},
    metrics,
    store::RecordStore,
};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Per-connection transaction state.
///
/// Dropping a session that still holds the transaction releases the lock on
/// its behalf, so EXIT, a dropped connection, a failed write and a panic in
/// the dispatcher all leave the lock free.
pub struct ClientSession {
    id: SessionId,
    lock: Arc<SessionLock>,
    holds_transaction: bool,
}

impl ClientSession {
    pub const fn new(id: SessionId, lock: Arc<SessionLock>) -> Self {
        Self {
            id,
            lock,
            holds_transaction: false,
        }
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn holds_transaction(&self) -> bool {
        self.holds_transaction
    }

    /// `NO_TX -> TX_ACTIVE`, without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::TransactionAlreadyActive`] if this session already holds it.
    /// - [`Error::TransactionBusy`] if anyone else holds it.
    pub fn begin(&mut self) -> Result<()> {
        if self.holds_transaction {
            return Err(Error::TransactionAlreadyActive);
        }
        self.lock.try_acquire(self.id)?;
        self.holds_transaction = true;
        metrics::increment_transactions();
        tracing::debug!("Session {} began a transaction", self.id);
        Ok(())
    }

    /// `TX_ACTIVE -> NO_TX`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoActiveTransaction`] if this session holds no transaction.
    ///   Lock state is left untouched.
    /// - [`Error::InvariantBreach`] if the lock disagrees about the holder.
    pub fn commit(&mut self) -> Result<()> {
        if !self.holds_transaction {
            return Err(Error::NoActiveTransaction);
        }
        self.lock.release(self.id)?;
        self.holds_transaction = false;
        tracing::debug!("Session {} committed", self.id);
        Ok(())
    }

    /// Mutations need the transaction, held by this session.
    ///
    /// # Errors
    ///
    /// [`Error::TransactionHeldElsewhere`] if another session holds the lock,
    /// [`Error::TransactionRequired`] if nobody does.
    pub fn ensure_can_modify(&self) -> Result<()> {
        if self.holds_transaction {
            return Ok(());
        }
        match self.lock.holder() {
            Some(_) => Err(Error::TransactionHeldElsewhere),
            None => Err(Error::TransactionRequired),
        }
    }

    /// Reads are refused while any transaction is open, this session's
    /// included.
    ///
    /// # Errors
    ///
    /// [`Error::TransactionBusy`] while the lock is held.
    pub fn ensure_can_read(&self) -> Result<()> {
        if self.lock.is_held() {
            return Err(Error::TransactionBusy);
        }
        Ok(())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.holds_transaction && self.lock.force_release(self.id) {
            metrics::increment_forced_releases();
            tracing::warn!(
                "Session {} ended inside a transaction; lock released",
                self.id
            );
        }
    }
}

pub(crate) fn welcome(id: SessionId) -> String {
    format!("OK: Welcome. You are user {id}. Send HELP for help.\n")
}

/// Serves one admitted connection until EXIT, end-of-stream, a fatal error
/// or shutdown.
///
/// The session, and with it any transaction it still holds, is dropped
/// before the admission permit, so the next admitted client finds the lock
/// free.
#[instrument(level = "info", skip_all, fields(user = session.id()))]
pub async fn run_session<S>(
    stream: TcpStream,
    session: ClientSession,
    dispatcher: Arc<Dispatcher<S>>,
    permit: AdmissionPermit,
    shutdown: CancellationToken,
) where
    S: RecordStore + 'static,
{
    let (reader, mut writer) = stream.into_split();
    tracing::debug!("Session started");

    let result = serve_lines(
        BufReader::new(reader),
        &mut writer,
        session,
        dispatcher,
        &shutdown,
    )
    .await;
    if let Err(e) = result {
        if e.is_fatal() {
            tracing::error!("Session aborted: {e}");
        } else {
            tracing::debug!("Session ended: {e}");
        }
    }

    // Readers on the client side observe end-of-stream.
    let _ = writer.shutdown().await;
    drop(permit);
    tracing::debug!("Session closed");
}

/// Longest command accepted, line terminator excluded.
pub const MAX_COMMAND_LENGTH: usize = 512;

/// One read from the client.
enum Incoming {
    Line(String),
    /// Bytes that can't be a command. The session replies and carries on.
    Rejected(Error),
    Closed,
}

/// Reads one newline-terminated command of at most [`MAX_COMMAND_LENGTH`]
/// bytes. An overlong line is skipped up to its newline.
async fn read_command<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Incoming>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_COMMAND_LENGTH as u64 + 1;
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(Incoming::Closed);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_COMMAND_LENGTH {
        skip_line(reader).await?;
        return Ok(Incoming::Rejected(Error::MalformedCommand {
            command: "command",
            reason: format!("longer than {MAX_COMMAND_LENGTH} bytes"),
        }));
    }

    match String::from_utf8(core::mem::take(buf)) {
        Ok(line) => Ok(Incoming::Line(line)),
        Err(_) => Ok(Incoming::Rejected(Error::UnknownCommand)),
    }
}

async fn skip_line<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (used, found) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(());
            }
            match chunk.iter().position(|&b| b == b'\n') {
                Some(end) => (end + 1, true),
                None => (chunk.len(), false),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}

async fn serve_lines<R, W, S>(
    mut reader: R,
    writer: &mut W,
    mut session: ClientSession,
    dispatcher: Arc<Dispatcher<S>>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: RecordStore + 'static,
{
    writer.write_all(welcome(session.id()).as_bytes()).await?;
    let mut buf = Vec::with_capacity(MAX_COMMAND_LENGTH + 1);

    loop {
        let incoming = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::debug!("Closing session for shutdown");
                return Ok(());
            }
            incoming = read_command(&mut reader, &mut buf) => incoming?,
        };

        let line = match incoming {
            Incoming::Line(line) => line,
            Incoming::Rejected(e) => {
                metrics::record_command("INVALID", false);
                writer.write_all(Reply::error(&e).render().as_bytes()).await?;
                continue;
            }
            Incoming::Closed => {
                tracing::debug!(
                    "Client disconnected (transaction open: {})",
                    session.holds_transaction()
                );
                return Ok(());
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                metrics::record_command("INVALID", false);
                writer.write_all(Reply::error(&e).render().as_bytes()).await?;
                continue;
            }
        };
        tracing::trace!("Received {}", command.verb());

        // Store I/O is blocking; the session rides along and comes back.
        let dispatcher = Arc::clone(&dispatcher);
        let (returned, reply) = tokio::task::spawn_blocking(move || {
            let reply = dispatcher.dispatch(&mut session, command);
            (session, reply)
        })
        .await
        .map_err(|e| Error::InvariantBreach(format!("dispatch task failed: {e}")))?;
        session = returned;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                writer.write_all(Reply::error(&e).render().as_bytes()).await?;
                return Err(e);
            }
        };

        writer.write_all(reply.render().as_bytes()).await?;
        if reply.closes_session() {
            return Ok(());
        }
    }
}

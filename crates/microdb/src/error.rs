//! Error types shared by the generator pipeline and the record server.
//!
//! Errors fall into two families:
//!
//! - *Recoverable*: a busy transaction lock, a command issued outside of a
//!   transaction, malformed input or a storage I/O failure. These are
//!   reported to the caller (usually as an `ERROR:` line on the wire) and
//!   never change lock state.
//! - *Fatal*: an [`Error::InvariantBreach`] means the synchronization
//!   protocol itself is broken. The affected component must stop instead of
//!   retrying.

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for `microdb`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Another session holds the transaction lock.
    #[error("Transaction in progress. Retry later.")]
    TransactionBusy,

    /// `COMMIT` was issued without a transaction.
    #[error("No active transaction to COMMIT.")]
    NoActiveTransaction,

    /// A mutating command was issued outside of a transaction.
    #[error("Modifications require BEGIN TRANSACTION.")]
    TransactionRequired,

    /// A mutating command was issued while another session holds the lock.
    #[error("Transaction in progress by another session. Retry later.")]
    TransactionHeldElsewhere,

    /// `BEGIN` was issued by the session that already holds the lock.
    #[error("Transaction already active in this session.")]
    TransactionAlreadyActive,

    /// The command was recognised but its arguments could not be parsed.
    #[error("Invalid {command} format: {reason}")]
    MalformedCommand {
        command: &'static str,
        reason: String,
    },

    /// The command verb was not recognised at all.
    #[error("Unrecognized command.")]
    UnknownCommand,

    /// A `WHERE`/`SET` clause named a column the schema doesn't have.
    #[error("Unknown field '{0}'.")]
    UnknownField(String),

    /// An `INSERT` reused an existing ID.
    #[error("ID {0} already exists.")]
    DuplicateId(u64),

    /// The durable store couldn't be read or written.
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    /// A line in the durable store couldn't be decoded.
    #[error("Corrupt record at line {line}: {reason}")]
    CorruptRecord { line: usize, reason: String },

    /// A synchronization invariant was violated. Never retried.
    #[error("Invariant breach: {0}")]
    InvariantBreach(String),

    /// The operation observed a termination request while waiting.
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// A peer thread dropped its end of an internal channel.
    #[error("Channel error: {context}")]
    ChannelClosed { context: String },

    /// Configuration rejected before anything was started.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Returns `true` for errors that indicate a synchronization bug.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantBreach(_))
    }

    /// Renders the error as a single wire status line (without newline).
    pub fn to_status_line(&self) -> String {
        format!("ERROR: {self}")
    }
}

use super::{command::Command, session::ClientSession};
use crate::{
    error::{Error, Result},
    metrics,
    record::{Column, Record},
    store::RecordStore,
};
use parking_lot::Mutex;
use tracing::instrument;

/// Terminates every multi-line reply.
pub const END_OF_REPLY: &str = "---END---";

const HELP: &[&str] = &[
    "Available commands:",
    "  BEGIN TRANSACTION                  take the exclusive lock",
    "  COMMIT TRANSACTION                 release the lock",
    "  SELECT ALL                         list every row",
    "  SELECT WHERE field=value           list matching rows",
    "  INSERT id;field;...                add a row (transaction required)",
    "  UPDATE ID=id SET field=value       change one column (transaction required)",
    "  DELETE ID=id                       remove a row (transaction required)",
    "  HELP                               show this text",
    "  EXIT                               close the session",
    "Reads are refused while any transaction is open.",
];

/// What to send back for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A single `OK:`/`ERROR:` line.
    Status(String),
    /// Several lines followed by [`END_OF_REPLY`].
    Lines(Vec<String>),
    /// A final status line, after which the session ends.
    Close(String),
}

impl Reply {
    pub fn ok(message: &str) -> Self {
        Self::Status(format!("OK: {message}"))
    }

    pub fn error(error: &Error) -> Self {
        Self::Status(error.to_status_line())
    }

    pub const fn closes_session(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Wire form, newline-terminated.
    pub fn render(&self) -> String {
        match self {
            Self::Status(line) | Self::Close(line) => format!("{line}\n"),
            Self::Lines(lines) => {
                let mut out = String::new();
                for line in lines {
                    out.push_str(line);
                    out.push('\n');
                }
                out.push_str(END_OF_REPLY);
                out.push('\n');
                out
            }
        }
    }
}

/// Routes parsed commands to the store, enforcing the transaction rules.
///
/// The store sits behind one mutex. A read checks the transaction lock while
/// holding the store mutex, so a transaction can't start modifying rows
/// halfway through a scan. The store mutex is always taken before the
/// transaction lock's, never the other way around.
pub struct Dispatcher<S> {
    store: Mutex<S>,
}

impl<S: RecordStore> Dispatcher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    /// Runs `command` on behalf of `session`.
    ///
    /// Recoverable failures become `ERROR:` replies.
    ///
    /// # Errors
    ///
    /// Only fatal errors ([`Error::is_fatal`]) are returned; the session
    /// must not continue after one.
    #[instrument(level = "debug", skip_all, fields(user = session.id(), verb = command.verb()))]
    pub fn dispatch(&self, session: &mut ClientSession, command: Command) -> Result<Reply> {
        let verb = command.verb();
        let outcome = self.execute(session, command);
        metrics::record_command(verb, outcome.is_ok());

        match outcome {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_fatal() => {
                tracing::error!("{verb} failed: {e}");
                Err(e)
            }
            Err(e) => {
                tracing::debug!("{verb} refused: {e}");
                Ok(Reply::error(&e))
            }
        }
    }

    fn execute(&self, session: &mut ClientSession, command: Command) -> Result<Reply> {
        if command.is_mutation() {
            session.ensure_can_modify()?;
        }

        match command {
            Command::Begin => {
                session.begin()?;
                Ok(Reply::ok("Transaction started. Exclusive lock acquired."))
            }
            Command::Commit => {
                session.commit()?;
                Ok(Reply::ok("Transaction committed. Lock released."))
            }
            Command::SelectAll => self.select(session, S::read_all),
            Command::SelectWhere { field, value } => self.select(session, |store| {
                let column = store
                    .schema()
                    .column(&field)
                    .ok_or_else(|| Error::UnknownField(field.clone()))?;
                store.find_where(column, &value)
            }),
            Command::Insert { id, fields } => self.insert(id, fields),
            Command::Update { id, field, value } => self.update(id, &field, &value),
            Command::Delete { id } => self.delete(id),
            Command::Help => Ok(Reply::Lines(HELP.iter().map(ToString::to_string).collect())),
            Command::Exit => Ok(Reply::Close("OK: Bye.".to_string())),
        }
    }

    /// Refuses the read while any transaction is open, before the query is
    /// even looked at.
    fn select<F>(&self, session: &ClientSession, query: F) -> Result<Reply>
    where
        F: FnOnce(&S) -> Result<Vec<Record>>,
    {
        let store = self.store.lock();
        session.ensure_can_read()?;

        let rows = query(&*store)?;
        let mut lines = Vec::with_capacity(rows.len() + 1);
        lines.push(store.schema().to_string());
        lines.extend(rows.iter().map(ToString::to_string));
        Ok(Reply::Lines(lines))
    }

    fn insert(&self, id: u64, fields: Vec<String>) -> Result<Reply> {
        let mut store = self.store.lock();

        let width = store.schema().width();
        if fields.len() != width {
            return Err(Error::MalformedCommand {
                command: "INSERT",
                reason: format!("expected {width} fields, got {}", fields.len()),
            });
        }
        if store.read_all()?.iter().any(|r| r.id == id) {
            return Err(Error::DuplicateId(id));
        }

        store.append_record(&Record { id, fields })?;
        Ok(Reply::ok("Row inserted."))
    }

    fn update(&self, id: u64, field: &str, value: &str) -> Result<Reply> {
        let mut store = self.store.lock();

        let idx = match store.schema().column(field) {
            Some(Column::Field(idx)) => idx,
            Some(Column::Id) => {
                return Err(Error::MalformedCommand {
                    command: "UPDATE",
                    reason: "the ID column cannot be updated".to_string(),
                });
            }
            None => return Err(Error::UnknownField(field.to_string())),
        };

        let mut records = store.read_all()?;
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(Reply::ok("0 rows updated."));
        };
        record.fields[idx] = value.to_string();

        store.rewrite(&records)?;
        Ok(Reply::ok("Row updated."))
    }

    fn delete(&self, id: u64) -> Result<Reply> {
        let mut store = self.store.lock();

        let mut records = store.read_all()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(Reply::ok("0 rows deleted."));
        }

        store.rewrite(&records)?;
        Ok(Reply::ok("Row deleted."))
    }
}

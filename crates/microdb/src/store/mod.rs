//! Durable record storage.
//!
//! Both the generator pipeline and the record server persist through the
//! [`RecordStore`] trait. The only implementation shipped is [`CsvStore`], a
//! line-per-record text file with a header row.

mod csv;

pub use csv::CsvStore;

use crate::{
    error::Result,
    record::{Column, Record, Schema, values_match},
};

/// Append/rewrite/read-all storage consumed by the concurrency cores.
///
/// Writers must flush after every mutating call; callers rely on a record
/// being visible to a fresh reader as soon as the call returns.
pub trait RecordStore: Send {
    /// The column layout of this store.
    fn schema(&self) -> &Schema;

    /// Writes the header row.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the underlying file can't be written.
    fn append_header(&mut self) -> Result<()>;

    /// Appends one record and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the underlying file can't be written.
    fn append_record(&mut self, record: &Record) -> Result<()>;

    /// Reads every record, in file order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] on read failure and
    /// [`crate::Error::CorruptRecord`] for undecodable lines.
    fn read_all(&self) -> Result<Vec<Record>>;

    /// Replaces the store contents with `records` (header preserved).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the underlying file can't be written.
    fn rewrite(&mut self, records: &[Record]) -> Result<()>;

    /// Pushes any buffered writes to the underlying file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the flush fails.
    fn flush(&mut self) -> Result<()>;

    /// Returns every record whose `column` equals `value`.
    ///
    /// # Errors
    ///
    /// Same as [`RecordStore::read_all`].
    fn find_where(&self, column: Column, value: &str) -> Result<Vec<Record>> {
        let wanted_id = value.trim().parse::<u64>().ok();
        let records = self.read_all()?;
        Ok(records
            .into_iter()
            .filter(|r| match column {
                Column::Id => wanted_id == Some(r.id),
                Column::Field(i) => r.fields.get(i).is_some_and(|f| values_match(f, value)),
            })
            .collect())
    }
}

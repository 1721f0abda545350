use super::RecordStore;
use crate::{
    error::{Error, Result},
    record::{Record, Schema},
};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

const SEPARATOR: char = ',';

/// Comma-separated text store with a header row.
///
/// Appends go through a buffered `O_APPEND` handle that is flushed after
/// every record. Rewrites truncate the file in place so the inode, and with it
/// any advisory lock held on the file, survives.
pub struct CsvStore {
    path: PathBuf,
    schema: Schema,
    writer: BufWriter<File>,
}

impl CsvStore {
    /// Creates (or truncates) a store at `path`. No header is written; call
    /// [`RecordStore::append_header`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file can't be created.
    pub fn create(path: impl AsRef<Path>, schema: Schema) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        File::create(&path)?;
        Self::with_append_handle(path, schema)
    }

    /// Opens an existing store, or creates one with `default_schema` and a
    /// header row if `path` doesn't exist yet or is empty.
    ///
    /// An existing file's header row takes precedence over `default_schema`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file can't be opened or created.
    pub fn open(path: impl AsRef<Path>, default_schema: Schema) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_blank = match fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if is_blank {
            let mut store = Self::create(&path, default_schema)?;
            store.append_header()?;
            return Ok(store);
        }

        let schema = read_header(&path)?.unwrap_or(default_schema);
        Self::with_append_handle(path, schema)
    }

    fn with_append_handle(path: PathBuf, schema: Schema) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            schema,
            writer: BufWriter::new(file),
        })
    }

    fn decode(&self, line_no: usize, line: &str) -> Result<Record> {
        let mut parts = line.split(SEPARATOR);
        let id = parts
            .next()
            .unwrap_or_default()
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::CorruptRecord {
                line: line_no,
                reason: format!("bad ID: {e}"),
            })?;
        let fields: Vec<String> = parts.map(|p| p.trim().to_string()).collect();
        if fields.len() != self.schema.width() {
            return Err(Error::CorruptRecord {
                line: line_no,
                reason: format!(
                    "expected {} fields, found {}",
                    self.schema.width(),
                    fields.len()
                ),
            });
        }
        Ok(Record { id, fields })
    }
}

fn is_header(line: &str) -> bool {
    line.split(SEPARATOR)
        .next()
        .is_some_and(|first| first.trim().eq_ignore_ascii_case("ID"))
}

fn read_header(path: &Path) -> Result<Option<Schema>> {
    let mut first = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first)?;
    let first = first.trim_end();
    if !is_header(first) {
        return Ok(None);
    }
    Ok(Some(Schema::new(first.split(SEPARATOR).skip(1).map(str::trim))))
}

impl RecordStore for CsvStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn append_header(&mut self) -> Result<()> {
        writeln!(self.writer, "{}", self.schema)?;
        self.writer.flush()?;
        Ok(())
    }

    fn append_record(&mut self, record: &Record) -> Result<()> {
        writeln!(self.writer, "{record}")?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Record>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || (idx == 0 && is_header(line)) {
                continue;
            }
            records.push(self.decode(idx + 1, line)?);
        }
        Ok(records)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        self.writer.flush()?;

        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{}", self.schema)?;
        for record in records {
            writeln!(out, "{record}")?;
        }
        out.flush()?;
        Ok(())
    }
}

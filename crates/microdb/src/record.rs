use core::fmt;

/// A single row of the durable store.
///
/// The core only cares about `id`; `fields` is an opaque, fixed-width list
/// whose meaning is described by a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: u64,
    pub fields: Vec<String>,
}

impl Record {
    pub fn new(id: u64, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for field in &self.fields {
            write!(f, ",{field}")?;
        }
        Ok(())
    }
}

/// Column names of a store. The first column is always the ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<String>,
}

/// Column a `WHERE`/`SET` clause refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    /// Index into [`Record::fields`].
    Field(usize),
}

impl Schema {
    /// Builds a schema from the names of the non-ID columns.
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut columns = vec![String::from("ID")];
        columns.extend(fields.into_iter().map(Into::into));
        Self { columns }
    }

    /// Schema served by the record server when it creates a fresh store.
    pub fn inventory() -> Self {
        Self::new(["Product", "Quantity", "Price"])
    }

    /// Schema of the generator pipeline's output.
    pub fn generated() -> Self {
        Self::new(["Fruit", "Color", "Number"])
    }

    /// Number of non-ID fields each record carries.
    pub fn width(&self) -> usize {
        self.columns.len() - 1
    }

    /// Resolves a column name, case-insensitively.
    pub fn column(&self, name: &str) -> Option<Column> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name.trim()))?;
        Some(match idx {
            0 => Column::Id,
            n => Column::Field(n - 1),
        })
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.columns.join(","))
    }
}

/// Compares a stored value with a filter value.
///
/// Values that both parse as numbers are compared numerically so that
/// `199.99` matches `199.990`.
pub fn values_match(stored: &str, wanted: &str) -> bool {
    if stored == wanted {
        return true;
    }
    match (stored.trim().parse::<f64>(), wanted.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => (a - b).abs() < 1e-9,
        _ => false,
    }
}

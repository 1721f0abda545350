use crate::error::{Error, Result};
use core::str::FromStr;

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Begin,
    Commit,
    SelectAll,
    SelectWhere { field: String, value: String },
    Insert { id: u64, fields: Vec<String> },
    Update { id: u64, field: String, value: String },
    Delete { id: u64 },
    Help,
    Exit,
}

impl Command {
    /// Upper-case verb, used for logging and metrics.
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::SelectAll | Self::SelectWhere { .. } => "SELECT",
            Self::Insert { .. } => "INSERT",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
            Self::Help => "HELP",
            Self::Exit => "EXIT",
        }
    }

    /// Whether the command changes the store.
    pub const fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Insert { .. } | Self::Update { .. } | Self::Delete { .. }
        )
    }
}

impl FromStr for Command {
    type Err = Error;

    /// Keywords are case-insensitive; field values keep their case.
    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(verb, rest)| (verb, rest.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "BEGIN" => transaction_keyword("BEGIN", rest).map(|()| Self::Begin),
            "COMMIT" => transaction_keyword("COMMIT", rest).map(|()| Self::Commit),
            "SELECT" => parse_select(rest),
            "INSERT" => parse_insert(rest),
            "UPDATE" => parse_update(rest),
            "DELETE" => Ok(Self::Delete {
                id: parse_id_clause("DELETE", rest)?,
            }),
            "HELP" if rest.is_empty() => Ok(Self::Help),
            "EXIT" | "QUIT" if rest.is_empty() => Ok(Self::Exit),
            _ => Err(Error::UnknownCommand),
        }
    }
}

fn malformed(command: &'static str, reason: impl Into<String>) -> Error {
    Error::MalformedCommand {
        command,
        reason: reason.into(),
    }
}

fn transaction_keyword(command: &'static str, rest: &str) -> Result<()> {
    if rest.is_empty() || rest.eq_ignore_ascii_case("TRANSACTION") {
        Ok(())
    } else {
        Err(malformed(command, format!("expected {command} TRANSACTION")))
    }
}

fn parse_select(rest: &str) -> Result<Command> {
    if rest.eq_ignore_ascii_case("ALL") {
        return Ok(Command::SelectAll);
    }

    let (keyword, condition) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| malformed("SELECT", "expected ALL or WHERE field=value"))?;
    if !keyword.eq_ignore_ascii_case("WHERE") {
        return Err(malformed("SELECT", "expected ALL or WHERE field=value"));
    }

    let (field, value) = parse_assignment("SELECT", condition)?;
    Ok(Command::SelectWhere {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_insert(rest: &str) -> Result<Command> {
    // `;` keeps commas out of the field list; a bare CSV row is accepted too.
    let separator = if rest.contains(';') { ';' } else { ',' };
    let mut parts = rest.split(separator).map(str::trim);

    let id = parts
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("INSERT", "expected INSERT id;field;..."))?;
    let id = parse_id("INSERT", id)?;

    let fields: Vec<String> = parts.map(|f| unquote(f).to_string()).collect();
    if fields.is_empty() {
        return Err(malformed("INSERT", "expected at least one field after the ID"));
    }
    if fields.iter().any(|f| f.contains(',')) {
        return Err(malformed("INSERT", "fields cannot contain ','"));
    }

    Ok(Command::Insert { id, fields })
}

fn parse_update(rest: &str) -> Result<Command> {
    // ASCII upper-casing keeps byte offsets intact.
    let upper = rest.to_ascii_uppercase();
    let set_at = upper
        .find(" SET ")
        .ok_or_else(|| malformed("UPDATE", "expected UPDATE ID=id SET field=value"))?;

    let id = parse_id_clause("UPDATE", &rest[..set_at])?;
    let (field, value) = parse_assignment("UPDATE", &rest[set_at + " SET ".len()..])?;
    if value.contains(',') {
        return Err(malformed("UPDATE", "values cannot contain ','"));
    }

    Ok(Command::Update {
        id,
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Parses `ID=<n>`.
fn parse_id_clause(command: &'static str, clause: &str) -> Result<u64> {
    let (field, value) = parse_assignment(command, clause)?;
    if !field.eq_ignore_ascii_case("ID") {
        return Err(malformed(command, "expected ID=id"));
    }
    parse_id(command, value)
}

fn parse_id(command: &'static str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| malformed(command, format!("'{raw}' is not a valid ID")))
}

/// Splits `field=value`, trimming both sides and stripping quotes from the
/// value.
fn parse_assignment<'a>(command: &'static str, text: &'a str) -> Result<(&'a str, &'a str)> {
    let (field, value) = text
        .split_once('=')
        .ok_or_else(|| malformed(command, "expected field=value"))?;
    let (field, value) = (field.trim(), unquote(value.trim()));
    if field.is_empty() || value.is_empty() {
        return Err(malformed(command, "expected field=value"));
    }
    Ok((field, value))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|&q| value.strip_prefix(q)?.strip_suffix(q))
        .unwrap_or(value)
}

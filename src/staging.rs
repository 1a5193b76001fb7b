use std::collections::HashSet;
use std::error::Error as StdError;
use std::path::Path;
use std::sync::LazyLock;

use csv::{ReaderBuilder, StringRecord};
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;
use serde::ser::SerializeStruct;
use serde_json::{Map, Number, Value};

use crate::archive::{self, CsvEntry};
use crate::error::HobsError;

// Suffix pandas appends when it disambiguates repeated header names.
static DUPLICATE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[0-9]$").expect("duplicate suffix pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedTable {
    pub name: String,
    pub columns: Vec<String>,
    pub dropped_columns: Vec<String>,
    pub rows: usize,
}

#[derive(Debug)]
pub struct StagingFailure {
    pub entry: String,
    pub error: HobsError,
}

impl Serialize for StagingFailure {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("StagingFailure", 2)?;
        state.serialize_field("entry", &self.entry)?;
        state.serialize_field("error", &error_chain(&self.error))?;
        state.end()
    }
}

/// Tables that loaded and entries that were skipped.
#[derive(Debug, Default, Serialize)]
pub struct StagingReport {
    pub tables: Vec<StagedTable>,
    pub failures: Vec<StagingFailure>,
}

impl StagingReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    /// Source index and final (lowercased) name of each kept column.
    pub keep: Vec<(usize, String)>,
    pub dropped: Vec<String>,
}

pub fn plan_columns(headers: &[String]) -> ColumnPlan {
    let mut keep = Vec::new();
    let mut dropped = Vec::new();
    let mut seen = HashSet::new();
    for (index, header) in headers.iter().enumerate() {
        let header = if header.trim().is_empty() {
            format!("Unnamed: {index}")
        } else {
            header.clone()
        };
        if DUPLICATE_SUFFIX.is_match(&header) {
            dropped.push(header);
            continue;
        }
        let lowered = header.to_lowercase();
        if !seen.insert(lowered.clone()) {
            dropped.push(header);
            continue;
        }
        keep.push((index, lowered));
    }
    ColumnPlan { keep, dropped }
}

pub fn open_database(path: &Path) -> Result<Connection, HobsError> {
    Ok(Connection::open(path)?)
}

/// Loads every CSV entry of a bulk export; bad entries are reported, not fatal.
pub fn stage(zip_bytes: &[u8], conn: &mut Connection) -> Result<StagingReport, HobsError> {
    let entries = archive::read_csv_entries(zip_bytes)?;
    let mut report = StagingReport::default();
    for CsvEntry { name, bytes } in entries {
        let table = archive::table_name(&name);
        match stage_csv(conn, &table, &name, &bytes) {
            Ok(staged) => {
                tracing::debug!(table = %staged.name, rows = staged.rows, "staged table");
                report.tables.push(staged);
            }
            Err(error) => {
                tracing::warn!(entry = %name, error = %error_chain(&error), "skipping CSV entry");
                report.failures.push(StagingFailure { entry: name, error });
            }
        }
    }
    Ok(report)
}

pub fn stage_to_path(zip_bytes: &[u8], path: &Path) -> Result<(Connection, StagingReport), HobsError> {
    let mut conn = open_database(path)?;
    let report = stage(zip_bytes, &mut conn)?;
    Ok((conn, report))
}

/// Replaces `table` with the contents of one CSV document.
pub fn stage_csv(
    conn: &mut Connection,
    table: &str,
    entry: &str,
    bytes: &[u8],
) -> Result<StagedTable, HobsError> {
    let csv_error = |source: csv::Error| HobsError::Csv {
        entry: entry.to_string(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>();
    if headers.is_empty() || headers.iter().all(|value| value.trim().is_empty()) {
        return Err(HobsError::EmptyTable(entry.to_string()));
    }
    let records = reader
        .records()
        .collect::<Result<Vec<StringRecord>, _>>()
        .map_err(csv_error)?;

    let plan = plan_columns(&headers);
    if plan.keep.is_empty() {
        return Err(HobsError::EmptyTable(entry.to_string()));
    }
    let affinities = plan
        .keep
        .iter()
        .map(|(index, _)| infer_affinity(records.iter().map(|record| record.get(*index).unwrap_or(""))))
        .collect::<Vec<_>>();

    let column_defs = plan
        .keep
        .iter()
        .zip(&affinities)
        .map(|((_, name), affinity)| format!("{} {}", quote_ident(name), affinity.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; plan.keep.len()].join(", ");

    let tx = conn.transaction()?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
    tx.execute(&format!("CREATE TABLE {} ({column_defs})", quote_ident(table)), [])?;
    {
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({placeholders})",
            quote_ident(table)
        ))?;
        for record in &records {
            let values = plan
                .keep
                .iter()
                .zip(&affinities)
                .map(|((index, _), affinity)| affinity.convert(record.get(*index).unwrap_or("")))
                .collect::<Vec<_>>();
            insert.execute(params_from_iter(values))?;
        }
    }
    tx.commit()?;

    Ok(StagedTable {
        name: table.to_string(),
        columns: plan.keep.into_iter().map(|(_, name)| name).collect(),
        dropped_columns: plan.dropped,
        rows: records.len(),
    })
}

pub fn table_names(conn: &Connection) -> Result<Vec<String>, HobsError> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Runs an ad-hoc query and returns each row as a JSON object.
pub fn query_rows(conn: &Connection, sql: &str) -> Result<Vec<Map<String, Value>>, HobsError> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::new();
        for (index, column) in columns.iter().enumerate() {
            object.insert(column.clone(), json_value(row.get_ref(index)?));
        }
        out.push(object);
    }
    Ok(out)
}

/// Renders items as a SQL `IN (...)` list body: `'a', 'b'`.
pub fn sql_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| format!("'{}'", item.as_ref().replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Real,
    Text,
}

impl Affinity {
    fn sql_type(self) -> &'static str {
        match self {
            Affinity::Integer => "INTEGER",
            Affinity::Real => "REAL",
            Affinity::Text => "TEXT",
        }
    }

    fn convert(self, raw: &str) -> SqlValue {
        if raw.is_empty() {
            return SqlValue::Null;
        }
        match self {
            Affinity::Integer => raw
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .unwrap_or_else(|_| SqlValue::Text(raw.to_string())),
            Affinity::Real => raw
                .trim()
                .parse::<f64>()
                .map(SqlValue::Real)
                .unwrap_or_else(|_| SqlValue::Text(raw.to_string())),
            Affinity::Text => SqlValue::Text(raw.to_string()),
        }
    }
}

fn infer_affinity<'a>(values: impl Iterator<Item = &'a str>) -> Affinity {
    let mut affinity = Affinity::Integer;
    let mut any = false;
    for value in values.filter(|value| !value.is_empty()) {
        any = true;
        let value = value.trim();
        if affinity == Affinity::Integer && value.parse::<i64>().is_err() {
            affinity = Affinity::Real;
        }
        if affinity == Affinity::Real && value.parse::<f64>().is_err() {
            return Affinity::Text;
        }
    }
    if any { affinity } else { Affinity::Text }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn error_chain(error: &HobsError) -> String {
    let mut message = error.to_string();
    let mut source = StdError::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn suffixed_duplicates_are_dropped() {
        let plan = plan_columns(&headers(&["x", "x.1", "x.2", "y"]));
        assert_eq!(plan.keep, vec![(0, "x".to_string()), (3, "y".to_string())]);
        assert_eq!(plan.dropped, vec!["x.1", "x.2"]);
    }

    #[test]
    fn case_duplicates_keep_first() {
        let plan = plan_columns(&headers(&["Study", "site", "STUDY"]));
        assert_eq!(
            plan.keep,
            vec![(0, "study".to_string()), (1, "site".to_string())]
        );
        assert_eq!(plan.dropped, vec!["STUDY"]);
    }

    #[test]
    fn multi_digit_suffix_is_kept() {
        let plan = plan_columns(&headers(&["depth.10"]));
        assert_eq!(plan.keep, vec![(0, "depth.10".to_string())]);
    }

    #[test]
    fn affinity_inference() {
        assert_eq!(infer_affinity(["1", "", "3"].into_iter()), Affinity::Integer);
        assert_eq!(infer_affinity(["1", "2.5"].into_iter()), Affinity::Real);
        assert_eq!(infer_affinity(["1", "drip"].into_iter()), Affinity::Text);
        assert_eq!(infer_affinity(["", ""].into_iter()), Affinity::Text);
    }

    #[test]
    fn sql_list_quotes_items() {
        assert_eq!(
            sql_list(["France", "Côte d'Ivoire"]),
            "'France', 'Côte d''Ivoire'"
        );
    }
}

use std::io::{Cursor, Read};

use serde_json::{Map, Value};
use zip::ZipArchive;

use crate::error::HobsError;

const JSON_SUFFIX: &str = ".json";
const CSV_SUFFIX: &str = ".csv";
// Declared entry sizes come from the archive header and are not trusted beyond this.
const MAX_PREALLOC: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq)]
pub struct JsonEntry {
    /// Entry name up to the first `.json`.
    pub label: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One mapping per entry: `{label_key: entry label, payload_key: parsed JSON}`.
pub fn normalize(
    zip_bytes: &[u8],
    label_key: &str,
    payload_key: &str,
) -> Result<Vec<Map<String, Value>>, HobsError> {
    let entries = read_json_entries(zip_bytes)?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let mut record = Map::new();
            record.insert(label_key.to_string(), Value::String(entry.label));
            record.insert(payload_key.to_string(), entry.payload);
            record
        })
        .collect())
}

pub fn read_json_entries(zip_bytes: &[u8]) -> Result<Vec<JsonEntry>, HobsError> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut content = Vec::with_capacity(capacity_hint(entry.size()));
        entry
            .read_to_end(&mut content)
            .map_err(|source| HobsError::EntryRead {
                entry: name.clone(),
                source,
            })?;
        let payload = serde_json::from_slice(&content).map_err(|source| HobsError::EntryJson {
            entry: name.clone(),
            source,
        })?;
        entries.push(JsonEntry {
            label: entry_label(&name).to_string(),
            payload,
        });
    }
    Ok(entries)
}

/// Raw bytes of every `.csv` entry; anything else in the archive is ignored.
pub fn read_csv_entries(zip_bytes: &[u8]) -> Result<Vec<CsvEntry>, HobsError> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !entry.name().to_lowercase().ends_with(CSV_SUFFIX) {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::with_capacity(capacity_hint(entry.size()));
        entry
            .read_to_end(&mut bytes)
            .map_err(|source| HobsError::EntryRead {
                entry: name.clone(),
                source,
            })?;
        entries.push(CsvEntry { name, bytes });
    }
    Ok(entries)
}

fn capacity_hint(declared_size: u64) -> usize {
    declared_size.min(MAX_PREALLOC) as usize
}

pub fn entry_label(name: &str) -> &str {
    name.split_once(JSON_SUFFIX)
        .map(|(label, _)| label)
        .unwrap_or(name)
}

/// `concat_sites.csv` -> `sites`; directory components are dropped.
pub fn table_name(entry_name: &str) -> String {
    let file = entry_name.rsplit('/').next().unwrap_or(entry_name);
    let stem = file
        .to_ascii_lowercase()
        .find(CSV_SUFFIX)
        .map(|end| &file[..end])
        .unwrap_or(file);
    stem.replace("concat_", "")
}

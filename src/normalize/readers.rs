use csv::ReaderBuilder;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use super::shape::RecordShape;
use super::text::json_to_text;
use crate::artifact;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Tsv,
    Json,
    Parquet,
    Lines,
}

impl FileFormat {
    pub fn detect(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => FileFormat::Csv,
            Some("tsv") => FileFormat::Tsv,
            Some("json") | Some("jsonl") | Some("ndjson") => FileFormat::Json,
            Some("parquet") => FileFormat::Parquet,
            _ => FileFormat::Lines,
        }
    }
}

/// Reads one input file into its record shape.
pub fn read_file(path: &Path) -> Result<RecordShape> {
    match FileFormat::detect(path) {
        FileFormat::Csv => read_delimited(path, b','),
        FileFormat::Tsv => read_delimited(path, b'\t'),
        FileFormat::Json => read_json(path),
        FileFormat::Parquet => {
            let (columns, rows) = artifact::read_rows(path)?;
            Ok(RecordShape::Tabular { columns, rows })
        }
        FileFormat::Lines => read_lines(path),
    }
}

/// Strict parse first; any record error switches to the permissive parser.
pub fn read_delimited(path: &Path, delimiter: u8) -> Result<RecordShape> {
    match read_delimited_strict(path, delimiter) {
        Ok(shape) => Ok(shape),
        Err(e) => {
            warn!("Strict parse of {} failed ({}), retrying permissively", path.display(), e);
            read_delimited_permissive(path, delimiter)
        }
    }
}

fn read_delimited_strict(path: &Path, delimiter: u8) -> Result<RecordShape> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)?;
    let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(RecordShape::Tabular { columns, rows })
}

fn read_delimited_permissive(path: &Path, delimiter: u8) -> Result<RecordShape> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let columns: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| String::from_utf8_lossy(h).into_owned())
        .collect();
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for record in reader.byte_records() {
        match record {
            Ok(record) => rows.push(
                record
                    .iter()
                    .map(|f| String::from_utf8_lossy(f).into_owned())
                    .collect(),
            ),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("Skipped {} unparseable rows in {}", skipped, path.display());
    }
    Ok(RecordShape::Tabular { columns, rows })
}

/// Line-oriented read with lossy UTF-8 decoding.
pub fn read_lines(path: &Path) -> Result<RecordShape> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(RecordShape::Lines(text.lines().map(str::to_string).collect()))
}

pub fn read_json(path: &Path) -> Result<RecordShape> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(shape_from_json(value)),
        Err(whole_err) => {
            // JSON lines: every non-empty line is its own document
            let mut docs = Vec::new();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Value>(line) {
                    Ok(v) => docs.push(v),
                    Err(_) => return Err(whole_err.into()),
                }
            }
            Ok(shape_from_json(Value::Array(docs)))
        }
    }
}

fn shape_from_json(value: Value) -> RecordShape {
    match value {
        Value::Array(items) => shape_from_array(items),
        Value::Object(map) => {
            if let Some(items) = map.values().find_map(|v| v.as_array()) {
                return shape_from_array(items.clone());
            }
            let columns: Vec<String> = map.keys().cloned().collect();
            let row = map.values().map(json_to_text).collect();
            RecordShape::Tabular { columns, rows: vec![row] }
        }
        scalar => RecordShape::Lines(vec![json_to_text(&scalar)]),
    }
}

fn shape_from_array(items: Vec<Value>) -> RecordShape {
    let columns: Vec<String> = match items.first() {
        Some(Value::Object(first)) => first.keys().cloned().collect(),
        _ => return RecordShape::Lines(items.iter().map(json_to_text).collect()),
    };
    let rows = items
        .iter()
        .map(|item| match item {
            Value::Object(obj) => columns
                .iter()
                .map(|c| obj.get(c).map(json_to_text).unwrap_or_default())
                .collect(),
            other => vec![json_to_text(other)],
        })
        .collect();
    RecordShape::Tabular { columns, rows }
}

//! Persisted pipeline artifacts.
//!
//! Tables are single-purpose parquet files made of UTF-8 columns (`nick`,
//! optionally `original`; `email`/`local_part`/`domain` for email sources).
//! Every writer targets a temporary file next to its destination and only
//! persists it on `finish()`, so an interrupted run never leaves a truncated
//! artifact under its final name.

use parquet::basic::{Compression, Type as PhysicalType, ZstdLevel};
use parquet::column::reader::get_typed_column_reader;
use parquet::data_type::{ByteArray, ByteArrayType};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::record::Field;
use parquet::schema::parser::parse_message_type;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

use crate::constants::{IO_BUFFER_SIZE, NICK_COLUMN, ORIGINAL_COLUMN, PARQUET_ROW_GROUP_SIZE};
use crate::error::{AggregatorError, Result};

fn temp_file_for(final_path: &Path) -> Result<NamedTempFile> {
    let parent = match final_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    Ok(NamedTempFile::new_in(parent)?)
}

fn persist(temp: NamedTempFile, final_path: &Path) -> Result<()> {
    temp.persist(final_path).map_err(|e| AggregatorError::Io(e.error))?;
    Ok(())
}

/// Line oriented text writer persisted atomically on `finish()`.
pub struct AtomicTextWriter {
    writer: BufWriter<NamedTempFile>,
    final_path: PathBuf,
}

impl AtomicTextWriter {
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let temp = temp_file_for(&final_path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(IO_BUFFER_SIZE, temp),
            final_path,
        })
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    pub fn finish(self) -> Result<PathBuf> {
        let temp = self
            .writer
            .into_inner()
            .map_err(|e| AggregatorError::Io(e.into_error()))?;
        persist(temp, &self.final_path)?;
        Ok(self.final_path)
    }
}

/// Parquet table of required UTF-8 columns, written in bounded row groups.
pub struct StringTableWriter {
    writer: SerializedFileWriter<NamedTempFile>,
    buffers: Vec<Vec<ByteArray>>,
    final_path: PathBuf,
    rows: usize,
}

impl StringTableWriter {
    pub fn new(final_path: impl AsRef<Path>, columns: &[&str]) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let fields: String = columns
            .iter()
            .map(|c| format!("REQUIRED BINARY {} (UTF8);", c))
            .collect::<Vec<_>>()
            .join(" ");
        let schema = Arc::new(parse_message_type(&format!("message schema {{ {} }}", fields))?);
        let props = Arc::new(
            WriterProperties::builder()
                .set_compression(Compression::ZSTD(ZstdLevel::default()))
                .build(),
        );
        let temp = temp_file_for(&final_path)?;
        let writer = SerializedFileWriter::new(temp, schema, props)?;
        Ok(Self {
            writer,
            buffers: vec![Vec::new(); columns.len()],
            final_path,
            rows: 0,
        })
    }

    /// Appends one row; `values` must have one entry per column.
    pub fn push_row(&mut self, values: &[&str]) -> Result<()> {
        if values.len() != self.buffers.len() {
            return Err(AggregatorError::Config(format!(
                "row has {} values for {} columns",
                values.len(),
                self.buffers.len()
            )));
        }
        for (buffer, value) in self.buffers.iter_mut().zip(values) {
            buffer.push(ByteArray::from(*value));
        }
        self.rows += 1;
        if self.buffers[0].len() >= PARQUET_ROW_GROUP_SIZE {
            self.flush_row_group()?;
        }
        Ok(())
    }

    fn flush_row_group(&mut self) -> Result<()> {
        if self.buffers.first().map_or(true, |b| b.is_empty()) {
            return Ok(());
        }
        let mut row_group = self.writer.next_row_group()?;
        let mut index = 0;
        while let Some(mut column) = row_group.next_column()? {
            column
                .typed::<ByteArrayType>()
                .write_batch(&self.buffers[index], None, None)?;
            column.close()?;
            index += 1;
        }
        row_group.close()?;
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Writes the footer and persists the table. Returns the row count.
    pub fn finish(mut self) -> Result<usize> {
        self.flush_row_group()?;
        let temp = self.writer.into_inner()?;
        persist(temp, &self.final_path)?;
        Ok(self.rows)
    }
}

/// Writes a `nick` table, with an `original` column when originals are given.
pub fn write_nick_table(path: &Path, nicks: &[String], originals: Option<&[String]>) -> Result<usize> {
    match originals {
        Some(originals) => {
            let mut writer = StringTableWriter::new(path, &[NICK_COLUMN, ORIGINAL_COLUMN])?;
            for (nick, original) in nicks.iter().zip(originals) {
                writer.push_row(&[nick.as_str(), original.as_str()])?;
            }
            writer.finish()
        }
        None => {
            let mut writer = StringTableWriter::new(path, &[NICK_COLUMN])?;
            for nick in nicks {
                writer.push_row(&[nick.as_str()])?;
            }
            writer.finish()
        }
    }
}

fn open_parquet(path: &Path) -> Result<SerializedFileReader<File>> {
    Ok(SerializedFileReader::new(File::open(path)?)?)
}

/// Leaf column names of a parquet file, in schema order.
pub fn column_names(path: &Path) -> Result<Vec<String>> {
    let reader = open_parquet(path)?;
    let schema = reader.metadata().file_metadata().schema_descr();
    Ok(schema.columns().iter().map(|c| c.name().to_string()).collect())
}

pub fn row_count(path: &Path) -> Result<usize> {
    let reader = open_parquet(path)?;
    Ok(reader.metadata().file_metadata().num_rows().max(0) as usize)
}

pub fn has_column(path: &Path, column: &str) -> Result<bool> {
    Ok(column_names(path)?.iter().any(|c| c == column))
}

/// Renders a parquet field as text. Nulls and nested values become empty.
pub fn field_to_text(field: &Field) -> String {
    match field {
        Field::Null => String::new(),
        Field::Str(s) => s.clone(),
        Field::Bytes(b) => String::from_utf8_lossy(b.data()).into_owned(),
        Field::Group(_) | Field::ListInternal(_) | Field::MapInternal(_) => String::new(),
        other => other.to_string(),
    }
}

/// Reads every row through the record API: `(columns, rows)`.
pub fn read_rows(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let columns = column_names(path)?;
    let reader = open_parquet(path)?;
    let mut rows = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row?;
        let mut values = vec![String::new(); columns.len()];
        for (name, field) in row.get_column_iter() {
            if let Some(idx) = columns.iter().position(|c| c == name) {
                values[idx] = field_to_text(field);
            }
        }
        rows.push(values);
    }
    Ok((columns, rows))
}

/// Reads one column fully through the record API. A missing column is an error.
pub fn read_column(path: &Path, column: &str) -> Result<Vec<String>> {
    let reader = open_parquet(path)?;
    let present = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .any(|c| c.name() == column);
    if !present {
        return Err(AggregatorError::Config(format!(
            "column '{}' not found in {}",
            column,
            path.display()
        )));
    }
    let mut values = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row?;
        if let Some((_, field)) = row.get_column_iter().find(|(name, _)| name.as_str() == column) {
            values.push(field_to_text(field));
        }
    }
    Ok(values)
}

/// Streams a UTF-8 column in batches of at most `batch_size` values, one row
/// group at a time. Null slots are skipped. Returns the number of values read.
pub fn scan_column_batches<F>(path: &Path, column: &str, batch_size: usize, mut on_batch: F) -> Result<u64>
where
    F: FnMut(Vec<String>) -> Result<()>,
{
    let reader = open_parquet(path)?;
    let metadata = reader.metadata();
    let schema = metadata.file_metadata().schema_descr();
    let col_idx = schema
        .columns()
        .iter()
        .position(|c| c.name() == column)
        .ok_or_else(|| {
            AggregatorError::Config(format!("column '{}' not found in {}", column, path.display()))
        })?;
    if schema.column(col_idx).physical_type() != PhysicalType::BYTE_ARRAY {
        return Err(AggregatorError::Config(format!(
            "column '{}' in {} is not a string column",
            column,
            path.display()
        )));
    }

    let batch_size = batch_size.max(1);
    let mut total = 0u64;
    for rg in 0..metadata.num_row_groups() {
        let group_rows = metadata.row_group(rg).num_rows().max(0) as usize;
        let row_group = reader.get_row_group(rg)?;
        let mut typed = get_typed_column_reader::<ByteArrayType>(row_group.get_column_reader(col_idx)?);
        loop {
            let mut values = Vec::with_capacity(batch_size.min(group_rows.max(1)));
            let mut def_levels = Vec::new();
            let (records, _, _) = typed.read_records(batch_size, Some(&mut def_levels), None, &mut values)?;
            if records == 0 {
                break;
            }
            total += values.len() as u64;
            on_batch(
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v.data()).into_owned())
                    .collect(),
            )?;
        }
    }
    Ok(total)
}

/// Strips a trailing `\n` or `\r\n`.
pub fn trim_line_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Streams the lines of a text file in batches, terminators stripped.
pub fn scan_text_batches<F>(path: &Path, batch_size: usize, mut on_batch: F) -> Result<u64>
where
    F: FnMut(Vec<String>) -> Result<()>,
{
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, File::open(path)?);
    let batch_size = batch_size.max(1);
    let mut batch = Vec::new();
    let mut line = Vec::new();
    let mut total = 0u64;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        batch.push(String::from_utf8_lossy(trim_line_terminator(&line)).into_owned());
        total += 1;
        if batch.len() >= batch_size {
            on_batch(std::mem::take(&mut batch))?;
        }
    }
    if !batch.is_empty() {
        on_batch(batch)?;
    }
    Ok(total)
}

pub fn is_parquet(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("parquet"))
}

/// Streams deduplicated values from either a parquet `nick` table or a text
/// file, detected by extension.
pub fn scan_values<F>(path: &Path, batch_size: usize, on_batch: F) -> Result<u64>
where
    F: FnMut(Vec<String>) -> Result<()>,
{
    if is_parquet(path) {
        scan_column_batches(path, NICK_COLUMN, batch_size, on_batch)
    } else {
        scan_text_batches(path, batch_size, on_batch)
    }
}

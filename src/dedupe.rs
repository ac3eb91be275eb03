//! Deduplicator stage.
//!
//! Three modes share one priority rule: sources (or chunks) are consumed in
//! priority order and the first occurrence of a value is the one kept.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::artifact::{self, trim_line_terminator, AtomicTextWriter, StringTableWriter};
use crate::constants::{chunk_index, IO_BUFFER_SIZE, NICK_COLUMN, ORIGINAL_COLUMN};
use crate::error::{AggregatorError, Result};
use crate::incident;
use crate::layout::CacheLayout;
use crate::metrics;
use crate::normalize::NormalizedArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeMode {
    Full,
    HighVolume,
    Chunks,
}

impl FromStr for DedupeMode {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(DedupeMode::Full),
            "high-volume" | "high_volume" => Ok(DedupeMode::HighVolume),
            "chunks" => Ok(DedupeMode::Chunks),
            other => Err(AggregatorError::Config(format!("unknown dedupe mode '{}'", other))),
        }
    }
}

impl fmt::Display for DedupeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DedupeMode::Full => "full",
            DedupeMode::HighVolume => "high-volume",
            DedupeMode::Chunks => "chunks",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DedupeReport {
    pub path: PathBuf,
    pub unique: u64,
    pub read_failures: Vec<String>,
    pub reused: bool,
}

impl DedupeReport {
    fn reused(path: PathBuf, unique: u64) -> Self {
        Self {
            path,
            unique,
            read_failures: Vec::new(),
            reused: true,
        }
    }
}

pub struct DeduplicatorService {
    layout: CacheLayout,
    force: bool,
    batch_size: usize,
}

impl DeduplicatorService {
    pub fn new(layout: CacheLayout, force: bool, batch_size: usize) -> Self {
        Self { layout, force, batch_size }
    }

    fn record_failure(&self, failures: &mut Vec<String>, phase: &str, slug: &str, error: &AggregatorError) {
        warn!(slug, "{} could not read source: {}", phase, error);
        incident::record(&self.layout.stage_error_log(), phase, Some(slug), error);
        failures.push(slug.to_string());
    }

    fn ordered(artifacts: &[NormalizedArtifact]) -> Vec<&NormalizedArtifact> {
        let mut ordered: Vec<&NormalizedArtifact> = artifacts.iter().collect();
        ordered.sort_by_key(|a| a.priority);
        ordered
    }

    /// Loads every source fully, concatenates in priority order and keeps the
    /// first occurrence of each nick. Originals are carried when any source has them.
    #[instrument(skip_all, fields(sources = artifacts.len()))]
    pub fn deduplicate_all(&self, artifacts: &[NormalizedArtifact]) -> Result<DedupeReport> {
        let output = self.layout.all_deduped();
        if output.exists() && !self.force {
            info!("Reusing {}", output.display());
            return Ok(DedupeReport::reused(output.clone(), artifact::row_count(&output)? as u64));
        }
        let started = Instant::now();
        let track_original = artifacts.iter().any(|a| a.keeps_original);

        let mut nicks: Vec<String> = Vec::new();
        let mut originals: Vec<String> = Vec::new();
        let mut failures = Vec::new();
        for source in Self::ordered(artifacts) {
            let loaded = artifact::read_column(&source.path, NICK_COLUMN).and_then(|n| {
                let o = if track_original && source.keeps_original {
                    artifact::read_column(&source.path, ORIGINAL_COLUMN)?
                } else {
                    Vec::new()
                };
                Ok((n, o))
            });
            match loaded {
                Ok((n, o)) => {
                    debug!(slug = %source.slug, values = n.len(), "Loaded source");
                    if track_original {
                        if o.len() == n.len() {
                            originals.extend(o);
                        } else {
                            originals.extend(n.iter().cloned());
                        }
                    }
                    nicks.extend(n);
                }
                Err(e) => self.record_failure(&mut failures, "deduplicate", &source.slug, &e),
            }
        }
        if nicks.is_empty() {
            return Err(AggregatorError::no_valid_data("deduplicate"));
        }

        let columns: &[&str] = if track_original {
            &[NICK_COLUMN, ORIGINAL_COLUMN]
        } else {
            &[NICK_COLUMN]
        };
        let mut writer = StringTableWriter::new(&output, columns)?;
        let mut seen: HashSet<&str> = HashSet::with_capacity(nicks.len());
        for (i, nick) in nicks.iter().enumerate() {
            if !seen.insert(nick.as_str()) {
                continue;
            }
            if track_original {
                writer.push_row(&[nick.as_str(), originals[i].as_str()])?;
            } else {
                writer.push_row(&[nick.as_str()])?;
            }
        }
        let unique = writer.finish()? as u64;

        info!("🧹 Full dedupe: {} values -> {} unique", nicks.len(), unique);
        metrics::record_deduped(unique);
        metrics::record_stage_duration("dedupe_full", started.elapsed().as_secs_f64());
        Ok(DedupeReport {
            path: output,
            unique,
            read_failures: failures,
            reused: false,
        })
    }

    /// Streams each source's `nick` column in batches into one growing set.
    /// Value-only: no originals are carried.
    #[instrument(skip_all, fields(sources = artifacts.len(), batch_size = self.batch_size))]
    pub fn deduplicate_high_volume(&self, artifacts: &[NormalizedArtifact]) -> Result<DedupeReport> {
        let output = self.layout.all_deduped();
        if output.exists() && !self.force {
            info!("Reusing {}", output.display());
            return Ok(DedupeReport::reused(output.clone(), artifact::row_count(&output)? as u64));
        }
        let started = Instant::now();

        let mut seen: HashSet<String> = HashSet::new();
        let mut writer = StringTableWriter::new(&output, &[NICK_COLUMN])?;
        let mut failures = Vec::new();
        let mut read_values = 0u64;

        for source in Self::ordered(artifacts) {
            let mut absorb = |batch: Vec<String>| -> Result<()> {
                for value in batch {
                    if !seen.contains(&value) {
                        writer.push_row(&[value.as_str()])?;
                        seen.insert(value);
                    }
                }
                Ok(())
            };
            let batched = artifact::scan_column_batches(&source.path, NICK_COLUMN, self.batch_size, &mut absorb);
            let result = match batched {
                Ok(count) => Ok(count),
                Err(e) => {
                    warn!(slug = %source.slug, "Batched scan failed ({}), falling back to a full read", e);
                    artifact::read_column(&source.path, NICK_COLUMN).and_then(|values| {
                        let count = values.len() as u64;
                        absorb(values)?;
                        Ok(count)
                    })
                }
            };
            match result {
                Ok(count) => read_values += count,
                Err(e) => self.record_failure(&mut failures, "deduplicate", &source.slug, &e),
            }
        }

        if read_values == 0 {
            return Err(AggregatorError::no_valid_data("deduplicate"));
        }
        let unique = writer.finish()? as u64;

        info!("🧹 High-volume dedupe: {} values -> {} unique", read_values, unique);
        metrics::record_deduped(unique);
        metrics::record_stage_duration("dedupe_high_volume", started.elapsed().as_secs_f64());
        Ok(DedupeReport {
            path: output,
            unique,
            read_failures: failures,
            reused: false,
        })
    }

    /// Chunk mode into the standard `deduped/deduped_chunks.txt`.
    pub fn deduplicate_chunks(&self, chunks_dir: &Path) -> Result<DedupeReport> {
        deduplicate_chunks(chunks_dir, &self.layout.deduped_chunks(), self.force, Some(&self.layout.stage_error_log()))
    }
}

/// `chunk_*.txt` files of `dir`, ordered by numeric index then name.
pub fn list_chunks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut chunks: Vec<(usize, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter_map(|p| {
            let index = p.file_name().and_then(|n| n.to_str()).and_then(chunk_index)?;
            Some((index, p))
        })
        .collect();
    chunks.sort();
    Ok(chunks.into_iter().map(|(_, p)| p).collect())
}

/// Streams every line of every chunk, in order, writing a line only the first
/// time its exact text (terminator stripped) is seen.
#[instrument(skip(error_log))]
pub fn deduplicate_chunks(
    chunks_dir: &Path,
    output: &Path,
    force: bool,
    error_log: Option<&Path>,
) -> Result<DedupeReport> {
    if output.exists() && !force {
        info!("Reusing {}", output.display());
        let unique = BufReader::new(File::open(output)?).split(b'\n').count() as u64;
        return Ok(DedupeReport::reused(output.to_path_buf(), unique));
    }
    let started = Instant::now();
    let chunks = if chunks_dir.exists() { list_chunks(chunks_dir)? } else { Vec::new() };
    if chunks.is_empty() {
        return Err(AggregatorError::no_valid_data("deduplicate chunks"));
    }

    let mut seen: HashSet<Box<[u8]>> = HashSet::new();
    let mut writer = AtomicTextWriter::new(output)?;
    let mut failures = Vec::new();
    let mut unique = 0u64;
    let mut total = 0u64;
    let mut readable = 0usize;
    let mut line = Vec::new();

    for chunk in &chunks {
        let name = chunk.display().to_string();
        let mut reader = match File::open(chunk) {
            Ok(f) => BufReader::with_capacity(IO_BUFFER_SIZE, f),
            Err(e) => {
                let e = AggregatorError::from(e);
                warn!(chunk = %name, "Skipping unreadable chunk: {}", e);
                if let Some(log) = error_log {
                    incident::record(log, "deduplicate chunks", None, &e);
                }
                failures.push(name);
                continue;
            }
        };
        readable += 1;
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    let e = AggregatorError::from(e);
                    warn!(chunk = %name, "Read failed mid-chunk: {}", e);
                    if let Some(log) = error_log {
                        incident::record(log, "deduplicate chunks", None, &e);
                    }
                    failures.push(name.clone());
                    break;
                }
            }
            total += 1;
            let key = trim_line_terminator(&line);
            if !seen.contains(key) {
                writer.write_raw(key)?;
                writer.write_raw(b"\n")?;
                seen.insert(key.into());
                unique += 1;
            }
        }
    }

    if readable == 0 {
        return Err(AggregatorError::no_valid_data("deduplicate chunks"));
    }
    let path = writer.finish()?;

    info!("🧹 Chunk dedupe: {} lines from {} chunks -> {} unique", total, chunks.len(), unique);
    metrics::record_deduped(unique);
    metrics::record_stage_duration("dedupe_chunks", started.elapsed().as_secs_f64());
    Ok(DedupeReport {
        path,
        unique,
        read_failures: failures,
        reused: false,
    })
}

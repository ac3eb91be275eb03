//! Splitter stage: streams line-oriented files into bounded `chunk_NNN.txt` files.
//!
//! Lines are copied byte for byte in traversal order, so concatenating the
//! chunks in file name order reproduces the input. At most one line is held
//! in memory at a time.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::artifact::AtomicTextWriter;
use crate::constants::{chunk_file_name, chunk_index, IO_BUFFER_SIZE, SPLIT_EXTENSIONS};
use crate::error::{AggregatorError, Result};
use crate::metrics;

#[derive(Debug, Clone, Default)]
pub struct SplitReport {
    pub chunks: Vec<PathBuf>,
    pub lines: u64,
    pub files: usize,
}

/// Owns the open chunk and rolls over once it holds `max_lines` lines.
pub(crate) struct ChunkRoller<'a> {
    output_dir: &'a Path,
    max_lines: usize,
    current: Option<AtomicTextWriter>,
    current_lines: usize,
    chunks: Vec<PathBuf>,
}

impl<'a> ChunkRoller<'a> {
    pub(crate) fn new(output_dir: &'a Path, max_lines: usize) -> Self {
        Self {
            output_dir,
            max_lines,
            current: None,
            current_lines: 0,
            chunks: Vec::new(),
        }
    }

    /// Writes one line, appending `\n` when `line` has no terminator.
    pub(crate) fn write_line(&mut self, line: &[u8]) -> Result<()> {
        if self.current.is_none() {
            let path = self.output_dir.join(chunk_file_name(self.chunks.len() + 1));
            self.current = Some(AtomicTextWriter::new(path)?);
        }
        if let Some(writer) = self.current.as_mut() {
            writer.write_raw(line)?;
            if !line.ends_with(b"\n") {
                writer.write_raw(b"\n")?;
            }
        }
        self.current_lines += 1;
        if self.current_lines >= self.max_lines {
            self.close_current()?;
        }
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            let path = writer.finish()?;
            debug!("Closed chunk {} ({} lines)", path.display(), self.current_lines);
            self.chunks.push(path);
            self.current_lines = 0;
        }
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<Vec<PathBuf>> {
        self.close_current()?;
        Ok(self.chunks)
    }
}

pub struct SplitterService {
    max_lines: usize,
}

impl SplitterService {
    pub fn new(max_lines: usize) -> Self {
        Self { max_lines }
    }

    pub fn split(&self, input_dir: &Path, output_dir: &Path) -> Result<SplitReport> {
        split(input_dir, output_dir, self.max_lines)
    }
}

/// Text-like files under `input`, in sorted depth-first order. `exclude`
/// (usually the output directory) is never entered.
pub fn input_files(input: &Path, exclude: &Path) -> Vec<PathBuf> {
    if input.is_file() {
        return vec![input.to_path_buf()];
    }
    WalkDir::new(input)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.path() != exclude)
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .and_then(|x| x.to_str())
                    .map_or(false, |x| SPLIT_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(x)))
        })
        .map(|e| e.into_path())
        .collect()
}

/// Removes `chunk_NNN.txt` files left by an earlier run.
pub fn remove_chunks(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_chunk = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(chunk_index)
            .is_some();
        if is_chunk && path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[instrument(skip_all, fields(input = %input_dir.display(), max_lines))]
pub fn split(input_dir: &Path, output_dir: &Path, max_lines: usize) -> Result<SplitReport> {
    if max_lines == 0 {
        return Err(AggregatorError::Config("max lines per chunk must be at least 1".into()));
    }
    let started = Instant::now();
    let files = input_files(input_dir, output_dir);
    fs::create_dir_all(output_dir)?;
    let stale = remove_chunks(output_dir)?;
    if stale > 0 {
        debug!("Removed {} stale chunks from {}", stale, output_dir.display());
    }

    let mut roller = ChunkRoller::new(output_dir, max_lines);
    let mut lines = 0u64;
    let mut line = Vec::new();
    for file in &files {
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, File::open(file)?);
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            roller.write_line(&line)?;
            lines += 1;
        }
    }
    let chunks = roller.finish()?;

    info!("✂️  Split {} lines from {} files into {} chunks", lines, files.len(), chunks.len());
    metrics::record_chunks(chunks.len() as u64);
    metrics::record_stage_duration("split", started.elapsed().as_secs_f64());
    Ok(SplitReport {
        chunks,
        lines,
        files: files.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn concat(chunks: &[PathBuf]) -> String {
        chunks.iter().map(|c| fs::read_to_string(c).unwrap()).collect()
    }

    #[test]
    fn test_rolls_over_at_max_lines() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(input.join("sub")).unwrap();
        fs::write(input.join("a.txt"), "1\n2\n3\n").unwrap();
        fs::write(input.join("sub").join("b.csv"), "4\n5").unwrap();
        fs::write(input.join("skip.parquet"), "binary").unwrap();
        let out = dir.path().join("splits");

        let report = split(&input, &out, 2).unwrap();
        assert_eq!(report.lines, 5);
        assert_eq!(report.files, 2);
        let names: Vec<_> = report
            .chunks
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["chunk_000001.txt", "chunk_000002.txt", "chunk_000003.txt"]);
        assert_eq!(fs::read_to_string(&report.chunks[2]).unwrap(), "5\n");
        assert_eq!(concat(&report.chunks), "1\n2\n3\n4\n5\n");
    }

    #[test]
    fn test_empty_input_writes_no_chunks_and_clears_stale() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(&input).unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("chunk_009.txt"), "old\n").unwrap();
        fs::write(out.join("keep.md"), "x").unwrap();

        let report = split(&input, &out, 10).unwrap();
        assert!(report.chunks.is_empty());
        assert!(!out.join("chunk_009.txt").exists());
        assert!(out.join("keep.md").exists());
    }

    #[test]
    fn test_zero_max_lines_rejected() {
        let dir = tempdir().unwrap();
        assert!(split(dir.path(), &dir.path().join("o"), 0).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn prop_split_round_trips(
            files in proptest::collection::vec(proptest::collection::vec("[a-z0-9 ]{0,8}", 0..20), 1..4),
            max_lines in 1usize..7,
        ) {
            let dir = tempdir().unwrap();
            let input = dir.path().join("in");
            fs::create_dir_all(&input).unwrap();
            let mut expected = String::new();
            for (i, lines) in files.iter().enumerate() {
                let mut content = String::new();
                for l in lines {
                    content.push_str(l);
                    content.push('\n');
                }
                fs::write(input.join(format!("{:02}.txt", i)), &content).unwrap();
                expected.push_str(&content);
            }
            let report = split(&input, &dir.path().join("out"), max_lines).unwrap();
            prop_assert_eq!(concat(&report.chunks), expected);
            for chunk in &report.chunks {
                prop_assert!(fs::read_to_string(chunk).unwrap().lines().count() <= max_lines);
            }
        }
    }
}

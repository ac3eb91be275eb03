//! Exporter stage: turns the deduplicated set into the files downstream
//! consumers read.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::artifact::{self, AtomicTextWriter, StringTableWriter};
use crate::constants::{
    DOMAIN_COLUMN, EMAIL_COLUMN, LOCAL_PART_COLUMN, NICK_COLUMN, ORIGINAL_COLUMN, ORIGINAL_EXPORT_FILE,
    STREAMING_EXPORT_FILE,
};
use crate::error::{AggregatorError, Result};
use crate::layout::CacheLayout;
use crate::metrics;
use crate::normalize::email::EmailRecord;
use crate::normalize::NormalizedArtifact;
use crate::splitter::{remove_chunks, ChunkRoller};

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    pub entries: u64,
    pub lines: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EmailExport {
    pub emails: usize,
    pub local_parts: usize,
    pub nicknames: usize,
    pub combined: usize,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Nicknames,
    Emails,
    Passwords,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Nicknames, Partition::Emails, Partition::Passwords];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Nicknames => "nicknames",
            Partition::Emails => "emails",
            Partition::Passwords => "passwords",
        }
    }

    pub fn accepts(&self, value: &str) -> bool {
        let has_at = value.contains('@');
        match self {
            Partition::Emails => has_at && value.contains('.'),
            Partition::Nicknames => !has_at && !value.trim().is_empty(),
            Partition::Passwords => !has_at && !value.contains(' ') && value.trim().chars().count() > 6,
        }
    }
}

impl FromStr for Partition {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nicknames" => Ok(Partition::Nicknames),
            "emails" => Ok(Partition::Emails),
            "passwords" => Ok(Partition::Passwords),
            other => Err(AggregatorError::Config(format!("unknown partition '{}'", other))),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Streaming,
    Original,
    Emails,
    Final,
    Nicknames,
    Passwords,
    All,
}

impl FromStr for ExportFormat {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "streaming" => Ok(ExportFormat::Streaming),
            "original" => Ok(ExportFormat::Original),
            "emails" => Ok(ExportFormat::Emails),
            "final" => Ok(ExportFormat::Final),
            "nicknames" => Ok(ExportFormat::Nicknames),
            "passwords" => Ok(ExportFormat::Passwords),
            "all" => Ok(ExportFormat::All),
            other => Err(AggregatorError::Config(format!("unknown export format '{}'", other))),
        }
    }
}

pub struct ExporterService {
    layout: CacheLayout,
    chunk_size: usize,
}

impl ExporterService {
    pub fn new(layout: CacheLayout, chunk_size: usize) -> Self {
        Self {
            layout,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Comma-joined blocks of up to `chunk_size` values per line, each block
    /// ending with a trailing comma.
    #[instrument(skip(self), fields(deduped = %deduped.display()))]
    pub fn export_streaming(&self, deduped: &Path, chunk_size: usize) -> Result<ExportReport> {
        let started = Instant::now();
        let chunk_size = chunk_size.max(1);
        let path = self.layout.output.join(STREAMING_EXPORT_FILE);
        let mut writer = AtomicTextWriter::new(&path)?;
        let mut in_block = 0usize;
        let mut lines = 0u64;

        let entries = artifact::scan_values(deduped, chunk_size, |batch| {
            for value in batch {
                writer.write_raw(value.as_bytes())?;
                writer.write_raw(b",")?;
                in_block += 1;
                if in_block == chunk_size {
                    writer.write_raw(b"\n")?;
                    lines += 1;
                    in_block = 0;
                }
            }
            Ok(())
        })?;
        if in_block > 0 {
            writer.write_raw(b"\n")?;
            lines += 1;
        }
        let path = writer.finish()?;

        info!("📤 Streaming export: {} entries on {} lines -> {}", entries, lines, path.display());
        metrics::record_exported(entries);
        metrics::record_stage_duration("export_streaming", started.elapsed().as_secs_f64());
        Ok(ExportReport { path, entries, lines })
    }

    /// Pairs every deduplicated value with the original form from the
    /// highest-priority source that has one, falling back to the nick itself.
    #[instrument(skip(self, artifacts), fields(deduped = %deduped.display()))]
    pub fn export_with_original(&self, deduped: &Path, artifacts: &[NormalizedArtifact]) -> Result<ExportReport> {
        let started = Instant::now();
        let mut ordered: Vec<&NormalizedArtifact> = artifacts.iter().filter(|a| a.keeps_original).collect();
        ordered.sort_by_key(|a| a.priority);

        let mut originals: HashMap<String, String> = HashMap::new();
        for source in ordered {
            let pairs = artifact::read_column(&source.path, NICK_COLUMN)
                .and_then(|n| Ok((n, artifact::read_column(&source.path, ORIGINAL_COLUMN)?)));
            match pairs {
                Ok((nicks, origs)) => {
                    for (nick, original) in nicks.into_iter().zip(origs) {
                        originals.entry(nick).or_insert(original);
                    }
                }
                Err(e) => warn!(slug = %source.slug, "Skipping originals: {}", e),
            }
        }
        debug!("{} original forms mapped", originals.len());

        let path = self.layout.output.join(ORIGINAL_EXPORT_FILE);
        let mut writer = StringTableWriter::new(&path, &[NICK_COLUMN, ORIGINAL_COLUMN])?;
        let entries = artifact::scan_values(deduped, self.chunk_size, |batch| {
            for nick in batch {
                let original = originals.get(&nick).map(String::as_str).unwrap_or(nick.as_str());
                writer.push_row(&[nick.as_str(), original])?;
            }
            Ok(())
        })?;
        let rows = writer.finish()? as u64;

        info!("📤 Original-form export: {} entries -> {}", entries, path.display());
        metrics::record_exported(entries);
        metrics::record_stage_duration("export_original", started.elapsed().as_secs_f64());
        Ok(ExportReport {
            path,
            entries,
            lines: rows,
        })
    }

    /// Emails, their local parts, the deduplicated nicknames and the union of
    /// both, each as text and (where tabular) parquet.
    #[instrument(skip(self), fields(deduped = %deduped.display()))]
    pub fn export_emails_and_nicknames(&self, deduped: &Path) -> Result<EmailExport> {
        let started = Instant::now();
        let email_tables = email_tables(&self.layout.normalized_emails)?;
        if email_tables.is_empty() {
            return Err(AggregatorError::no_valid_data("export emails"));
        }

        let mut seen_emails = HashSet::new();
        let mut records: Vec<EmailRecord> = Vec::new();
        for table in &email_tables {
            match artifact::read_column(table, EMAIL_COLUMN) {
                Ok(emails) => {
                    for raw in emails {
                        if let Some(record) = EmailRecord::parse(&raw) {
                            if seen_emails.insert(record.email.clone()) {
                                records.push(record);
                            }
                        }
                    }
                }
                Err(e) => warn!(table = %table.display(), "Skipping email table: {}", e),
            }
        }
        if records.is_empty() {
            return Err(AggregatorError::no_valid_data("export emails"));
        }

        let emails_dir = self.layout.partition_dir(Partition::Emails.as_str());
        let nick_dir = self.layout.partition_dir(Partition::Nicknames.as_str());
        let mut files = Vec::new();

        let mut table = StringTableWriter::new(emails_dir.join("emails.parquet"), &[EMAIL_COLUMN, LOCAL_PART_COLUMN, DOMAIN_COLUMN])?;
        for r in &records {
            table.push_row(&[r.email.as_str(), r.local_part.as_str(), r.domain.as_str()])?;
        }
        table.finish()?;
        files.push(emails_dir.join("emails.parquet"));
        files.push(write_lines(&emails_dir.join("emails.txt"), records.iter().map(|r| r.email.as_str()))?);

        let mut seen_locals = HashSet::new();
        let local_parts: Vec<&str> = records
            .iter()
            .map(|r| r.local_part.as_str())
            .filter(|l| seen_locals.insert(*l))
            .collect();
        files.push(write_lines(&nick_dir.join("nicknames_from_emails.txt"), local_parts.iter().copied())?);

        let mut nicknames: Vec<String> = Vec::new();
        artifact::scan_values(deduped, self.chunk_size, |batch| {
            nicknames.extend(batch);
            Ok(())
        })?;
        files.push(write_lines(&nick_dir.join("nicknames.txt"), nicknames.iter().map(String::as_str))?);
        files.push(write_single_column(&nick_dir.join("nicknames.parquet"), nicknames.iter().map(String::as_str))?);

        let known: HashSet<&str> = nicknames.iter().map(String::as_str).collect();
        let combined: Vec<&str> = nicknames
            .iter()
            .map(String::as_str)
            .chain(local_parts.iter().copied().filter(|l| !known.contains(l)))
            .collect();
        files.push(write_lines(&nick_dir.join("combined_nicknames.txt"), combined.iter().copied())?);
        files.push(write_single_column(&nick_dir.join("combined_nicknames.parquet"), combined.iter().copied())?);

        info!(
            "📧 Email export: {} emails, {} local parts, {} nicknames, {} combined",
            records.len(),
            local_parts.len(),
            nicknames.len(),
            combined.len()
        );
        metrics::record_exported(records.len() as u64 + combined.len() as u64);
        metrics::record_stage_duration("export_emails", started.elapsed().as_secs_f64());
        Ok(EmailExport {
            emails: records.len(),
            local_parts: local_parts.len(),
            nicknames: nicknames.len(),
            combined: combined.len(),
            files,
        })
    }

    /// One value per line across `chunk_NNN.txt` files of `lines_per_file`
    /// lines. Every line ends with a comma except the last line of the last file.
    #[instrument(skip(self), fields(deduped = %deduped.display()))]
    pub fn export_final_chunks(&self, deduped: &Path, lines_per_file: usize) -> Result<Vec<PathBuf>> {
        if lines_per_file == 0 {
            return Err(AggregatorError::Config("lines per file must be at least 1".into()));
        }
        let started = Instant::now();
        let out_dir = &self.layout.final_chunks;
        fs::create_dir_all(out_dir)?;
        remove_chunks(out_dir)?;

        let mut roller = ChunkRoller::new(out_dir, lines_per_file);
        let mut pending: Option<String> = None;
        let mut line = Vec::new();
        let entries = artifact::scan_values(deduped, self.chunk_size, |batch| {
            for value in batch {
                if let Some(previous) = pending.replace(value) {
                    line.clear();
                    line.extend_from_slice(previous.as_bytes());
                    line.extend_from_slice(b",\n");
                    roller.write_line(&line)?;
                }
            }
            Ok(())
        })?;
        if let Some(last) = pending {
            roller.write_line(last.as_bytes())?;
        }
        let chunks = roller.finish()?;

        info!("📦 Final split: {} entries into {} files", entries, chunks.len());
        metrics::record_chunks(chunks.len() as u64);
        metrics::record_stage_duration("export_final", started.elapsed().as_secs_f64());
        Ok(chunks)
    }

    /// Filters the deduplicated values into `output/<partition>/<partition>.txt`
    /// for every selected partition in a single pass.
    #[instrument(skip(self), fields(deduped = %deduped.display()))]
    pub fn export_partitions(&self, deduped: &Path, selection: &[Partition]) -> Result<Vec<ExportReport>> {
        let started = Instant::now();
        let mut selected: Vec<Partition> = Vec::new();
        for p in selection {
            if !selected.contains(p) {
                selected.push(*p);
            }
        }
        let mut writers = Vec::with_capacity(selected.len());
        for p in &selected {
            let dir = self.layout.partition_dir(p.as_str());
            writers.push((*p, AtomicTextWriter::new(dir.join(format!("{}.txt", p.as_str())))?, 0u64));
        }

        artifact::scan_values(deduped, self.chunk_size, |batch| {
            for value in &batch {
                for (partition, writer, count) in writers.iter_mut() {
                    if partition.accepts(value) {
                        writer.write_line(value)?;
                        *count += 1;
                    }
                }
            }
            Ok(())
        })?;

        let mut reports = Vec::with_capacity(writers.len());
        for (partition, writer, count) in writers {
            let path = writer.finish()?;
            info!(partition = %partition, "📤 {} entries -> {}", count, path.display());
            metrics::record_exported(count);
            reports.push(ExportReport {
                path,
                entries: count,
                lines: count,
            });
        }
        metrics::record_stage_duration("export_partitions", started.elapsed().as_secs_f64());
        Ok(reports)
    }
}

/// Email tables under `dir`, sorted by file name.
fn email_tables(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut tables: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && artifact::is_parquet(p))
        .collect();
    tables.sort();
    Ok(tables)
}

fn write_lines<'a>(path: &Path, values: impl Iterator<Item = &'a str>) -> Result<PathBuf> {
    let mut writer = AtomicTextWriter::new(path)?;
    for value in values {
        writer.write_line(value)?;
    }
    writer.finish()
}

fn write_single_column<'a>(path: &Path, values: impl Iterator<Item = &'a str>) -> Result<PathBuf> {
    let mut writer = StringTableWriter::new(path, &[NICK_COLUMN])?;
    for value in values {
        writer.push_row(&[value])?;
    }
    writer.finish()?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn setup(values: &str) -> (TempDir, ExporterService, PathBuf) {
        let dir = tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("raw"));
        let deduped = layout.deduped_chunks();
        fs::create_dir_all(&layout.deduped).unwrap();
        fs::write(&deduped, values).unwrap();
        (dir, ExporterService::new(layout, 2), deduped)
    }

    #[test]
    fn test_streaming_blocks_end_with_comma() {
        let (_dir, svc, deduped) = setup("a\nb\nc\nd\ne\n");
        let report = svc.export_streaming(&deduped, 2).unwrap();
        assert_eq!(report.entries, 5);
        assert_eq!(report.lines, 3);
        assert_eq!(fs::read_to_string(&report.path).unwrap(), "a,b,\nc,d,\ne,\n");
    }

    #[test]
    fn test_final_chunks_omit_only_the_last_comma() {
        let (dir, svc, deduped) = setup("a\nb\nc\nd\ne\n");
        let chunks = svc.export_final_chunks(&deduped, 2).unwrap();
        let contents: Vec<String> = chunks.iter().map(|c| fs::read_to_string(c).unwrap()).collect();
        assert_eq!(contents, vec!["a,\nb,\n", "c,\nd,\n", "e\n"]);
        assert!(chunks[0].starts_with(dir.path().join("output").join("final")));

        // Exact multiple of the file size: the boundary falls on the last file
        let (_dir, svc, deduped) = setup("a\nb\nc\nd\n");
        let chunks = svc.export_final_chunks(&deduped, 2).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(fs::read_to_string(&chunks[1]).unwrap(), "c,\nd\n");
    }

    #[test]
    fn test_final_chunks_replace_stale_files_and_handle_empty_input() {
        let (_dir, svc, deduped) = setup("");
        fs::create_dir_all(&svc.layout.final_chunks).unwrap();
        fs::write(svc.layout.final_chunks.join("chunk_004.txt"), "old,\n").unwrap();
        let chunks = svc.export_final_chunks(&deduped, 3).unwrap();
        assert!(chunks.is_empty());
        assert!(!svc.layout.final_chunks.join("chunk_004.txt").exists());
        assert!(svc.export_final_chunks(&deduped, 0).is_err());
    }

    #[test]
    fn test_partitions_filter_values() {
        let (dir, svc, deduped) = setup("bob\nbob@mail.com\nhunter22\nlong password\nroot@local\n");
        let reports = svc.export_partitions(&deduped, &Partition::ALL).unwrap();
        assert_eq!(reports.len(), 3);
        let read = |name: &str| fs::read_to_string(dir.path().join("output").join(name).join(format!("{}.txt", name))).unwrap();
        assert_eq!(read("nicknames"), "bob\nhunter22\nlong password\n");
        assert_eq!(read("emails"), "bob@mail.com\n");
        assert_eq!(read("passwords"), "hunter22\n");
    }

    #[test]
    fn test_original_export_prefers_priority_source() {
        let (_dir, svc, deduped) = setup("alice\nbob\ncarol\n");
        let layout = svc.layout.clone();
        let make = |priority: usize, slug: &str, nicks: &[&str], origs: &[&str]| {
            let path = layout.normalized_artifact(slug);
            let nicks: Vec<String> = nicks.iter().map(|s| s.to_string()).collect();
            let origs: Vec<String> = origs.iter().map(|s| s.to_string()).collect();
            let values = artifact::write_nick_table(&path, &nicks, Some(&origs)).unwrap();
            NormalizedArtifact {
                slug: slug.into(),
                priority,
                text_path: layout.text_sidecar(priority, slug),
                path,
                email_path: None,
                values,
                keeps_original: true,
                reused: false,
            }
        };
        let low = make(1, "b", &["alice", "carol"], &["ALICE", "Carol"]);
        let high = make(0, "a", &["alice", "bob"], &["Alice", "Bob"]);

        let report = svc.export_with_original(&deduped, &[low, high]).unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(
            artifact::read_column(&report.path, ORIGINAL_COLUMN).unwrap(),
            vec!["Alice", "Bob", "Carol"]
        );
    }

    #[test]
    fn test_email_export_writes_all_partitions() {
        let (dir, svc, deduped) = setup("alice\njdoe\n");
        let table = svc.layout.email_artifact("mails");
        let mut writer = StringTableWriter::new(&table, &[EMAIL_COLUMN, LOCAL_PART_COLUMN, DOMAIN_COLUMN]).unwrap();
        for email in ["jdoe@x.io", "kim@y.org", "JDOE@x.io"] {
            let r = EmailRecord::parse(email).unwrap();
            writer.push_row(&[r.email.as_str(), r.local_part.as_str(), r.domain.as_str()]).unwrap();
        }
        writer.finish().unwrap();

        let export = svc.export_emails_and_nicknames(&deduped).unwrap();
        assert_eq!(export.emails, 2);
        assert_eq!(export.local_parts, 2);
        assert_eq!(export.combined, 3);
        let nick_dir = dir.path().join("output").join("nicknames");
        assert_eq!(fs::read_to_string(nick_dir.join("combined_nicknames.txt")).unwrap(), "alice\njdoe\nkim\n");
        assert_eq!(fs::read_to_string(nick_dir.join("nicknames_from_emails.txt")).unwrap(), "jdoe\nkim\n");
        assert_eq!(
            artifact::read_column(&dir.path().join("output/emails/emails.parquet"), DOMAIN_COLUMN).unwrap(),
            vec!["x.io", "y.org"]
        );
    }

    #[test]
    fn test_email_export_without_tables_is_no_valid_data() {
        let (_dir, svc, deduped) = setup("alice\n");
        let err = svc.export_emails_and_nicknames(&deduped).unwrap_err();
        assert!(matches!(err, AggregatorError::NoValidData { .. }));
    }
}

//! Normalizer stage: raw per-source files to one canonical `nick` table per slug.

pub mod email;
pub mod readers;
pub mod shape;
pub mod special;
pub mod text;

pub use shape::{resolve_column, ColumnResolution, RecordShape};
pub use special::SpecialSource;
pub use text::normalize_nick;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::archive::{self, ArchiveFormat};
use crate::artifact::{self, AtomicTextWriter, StringTableWriter};
use crate::config::Source;
use crate::constants::{
    DOMAIN_COLUMN, DOWNLOAD_ERROR_LOG, EMAIL_COLUMN, LOCAL_PART_COLUMN, NICK_COLUMN, ORIGINAL_COLUMN,
};
use crate::error::{AggregatorError, Result};
use crate::incident;
use crate::layout::CacheLayout;
use crate::metrics;
use email::{dedupe_by_email, EmailRecord};

/// A per-source normalized table and its text sidecar.
#[derive(Debug, Clone)]
pub struct NormalizedArtifact {
    pub slug: String,
    pub priority: usize,
    pub path: PathBuf,
    pub text_path: PathBuf,
    pub email_path: Option<PathBuf>,
    pub values: usize,
    pub keeps_original: bool,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct NormalizeFailure {
    pub slug: String,
    pub message: String,
}

/// Successes in priority order, plus the sources that were skipped.
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub artifacts: Vec<NormalizedArtifact>,
    pub failures: Vec<NormalizeFailure>,
}

impl NormalizeReport {
    pub fn total_values(&self) -> usize {
        self.artifacts.iter().map(|a| a.values).sum()
    }
}

/// Nick values of one file (or one source), deduplicated in first-seen order.
#[derive(Debug, Default)]
struct NickSet {
    seen: HashSet<String>,
    nicks: Vec<String>,
    originals: Vec<String>,
}

impl NickSet {
    fn push(&mut self, raw: &str) {
        let nick = normalize_nick(raw);
        if nick.is_empty() || self.seen.contains(&nick) {
            return;
        }
        self.seen.insert(nick.clone());
        self.nicks.push(nick);
        self.originals.push(raw.trim().to_string());
    }
}

pub struct NormalizerService {
    layout: CacheLayout,
    force: bool,
    data_file_exts: Vec<String>,
}

impl NormalizerService {
    pub fn new(layout: CacheLayout, force: bool, data_file_exts: Vec<String>) -> Self {
        let data_file_exts = data_file_exts
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self { layout, force, data_file_exts }
    }

    /// Normalizes every source that has a raw path, in configuration order.
    /// A failing source is logged and skipped.
    #[instrument(skip_all, fields(sources = sources.len()))]
    pub fn normalize_all(&self, sources: &[Source], raw_paths: &[(String, PathBuf)]) -> NormalizeReport {
        let started = Instant::now();
        let mut report = NormalizeReport::default();

        for (priority, source) in sources.iter().enumerate() {
            let Some((_, raw_path)) = raw_paths.iter().find(|(slug, _)| slug == &source.slug) else {
                debug!(slug = %source.slug, "No raw data, skipping");
                continue;
            };
            match self.normalize_source(priority, source, raw_path) {
                Ok(artifact) => {
                    info!(slug = %source.slug, values = artifact.values, reused = artifact.reused, "✅ Normalized");
                    report.artifacts.push(artifact);
                }
                Err(e) => {
                    error!(slug = %source.slug, "Normalization failed: {}", e);
                    incident::record(&self.layout.stage_error_log(), "normalize", Some(&source.slug), &e);
                    report.failures.push(NormalizeFailure {
                        slug: source.slug.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        metrics::record_normalized(report.total_values() as u64);
        metrics::record_stage_duration("normalize", started.elapsed().as_secs_f64());
        report
    }

    #[instrument(skip(self, source, raw_path), fields(slug = %source.slug))]
    pub fn normalize_source(&self, priority: usize, source: &Source, raw_path: &Path) -> Result<NormalizedArtifact> {
        let slug = source.slug.as_str();
        let output = self.layout.normalized_artifact(slug);
        let text_path = self.layout.text_sidecar(priority, slug);
        let email_output = self.layout.email_artifact(slug);

        if output.exists() && !self.force {
            return self.reuse(priority, source, output, text_path, email_output);
        }
        if !raw_path.exists() {
            return Err(AggregatorError::source(
                slug,
                format!("raw path {} does not exist", raw_path.display()),
            ));
        }

        let root = self.prepare_root(raw_path)?;
        let root = match &source.path {
            Some(sub) if root.join(sub).exists() => root.join(sub),
            _ => root,
        };

        let mut set = NickSet::default();
        let mut emails: Vec<EmailRecord> = Vec::new();

        let special = match SpecialSource::from_slug(slug) {
            Some(special) => special.extract(&root)?,
            None => None,
        };

        match special {
            Some(nicks) => {
                for nick in nicks {
                    set.push(&nick);
                }
            }
            None => {
                let files = self.discover_files(&root);
                if files.is_empty() {
                    return Err(AggregatorError::source(
                        slug,
                        format!("no data files found in {}", root.display()),
                    ));
                }
                let mut read_any = false;
                for file in &files {
                    let values = match readers::read_file(file) {
                        Ok(shape) => shape.into_values(),
                        Err(e) => {
                            warn!(slug, file = %file.display(), "Skipping unreadable file: {}", e);
                            continue;
                        }
                    };
                    read_any = true;
                    if source.is_email {
                        for value in &values {
                            match EmailRecord::parse(value) {
                                Some(record) => {
                                    set.push(&record.local_part);
                                    emails.push(record);
                                }
                                None => set.push(value),
                            }
                        }
                    } else {
                        for value in &values {
                            set.push(value);
                        }
                    }
                }
                if !read_any {
                    return Err(AggregatorError::source(slug, "no readable data files"));
                }
            }
        }

        if set.nicks.is_empty() {
            return Err(AggregatorError::source(slug, "no valid values after normalization"));
        }

        let originals = source.keep_original.then_some(set.originals.as_slice());
        let values = artifact::write_nick_table(&output, &set.nicks, originals)?;
        self.write_sidecar(slug, &text_path, &set.nicks)?;

        let email_path = if emails.is_empty() {
            None
        } else {
            let mut writer = StringTableWriter::new(&email_output, &[EMAIL_COLUMN, LOCAL_PART_COLUMN, DOMAIN_COLUMN])?;
            for r in &dedupe_by_email(emails) {
                writer.push_row(&[r.email.as_str(), r.local_part.as_str(), r.domain.as_str()])?;
            }
            writer.finish()?;
            Some(email_output)
        };

        Ok(NormalizedArtifact {
            slug: slug.to_string(),
            priority,
            path: output,
            text_path,
            email_path,
            values,
            keeps_original: source.keep_original,
            reused: false,
        })
    }

    fn reuse(
        &self,
        priority: usize,
        source: &Source,
        output: PathBuf,
        text_path: PathBuf,
        email_output: PathBuf,
    ) -> Result<NormalizedArtifact> {
        debug!(slug = %source.slug, "Reusing cached artifact {}", output.display());
        if !text_path.exists() {
            let nicks = artifact::read_column(&output, NICK_COLUMN)?;
            self.write_sidecar(&source.slug, &text_path, &nicks)?;
        } else {
            self.remove_stale_sidecars(&source.slug, &text_path)?;
        }
        Ok(NormalizedArtifact {
            slug: source.slug.clone(),
            priority,
            values: artifact::row_count(&output)?,
            keeps_original: artifact::has_column(&output, ORIGINAL_COLUMN)?,
            email_path: email_output.exists().then_some(email_output),
            path: output,
            text_path,
            reused: true,
        })
    }

    /// Extracts archives in place; a raw archive file resolves to its extracted directory.
    fn prepare_root(&self, raw_path: &Path) -> Result<PathBuf> {
        let extracted = archive::extract_all(raw_path)?;
        if raw_path.is_file() && ArchiveFormat::detect(raw_path).is_some() {
            if let Some(dir) = extracted.into_iter().next() {
                return Ok(dir);
            }
        }
        Ok(raw_path.to_path_buf())
    }

    /// Recognized data files under `root`, sorted; falls back to every file
    /// directly inside `root` when none match.
    pub fn discover_files(&self, root: &Path) -> Vec<PathBuf> {
        if root.is_file() {
            return vec![root.to_path_buf()];
        }
        let matching: Vec<PathBuf> = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git" && !archive::is_staging_dir(e.file_name()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && self.is_data_file(e.path()))
            .map(|e| e.into_path())
            .collect();
        if !matching.is_empty() {
            return matching;
        }

        let mut fallback: Vec<PathBuf> = fs::read_dir(root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.is_file()
                            && ArchiveFormat::detect(p).is_none()
                            && p.file_name().map_or(true, |n| n != DOWNLOAD_ERROR_LOG)
                    })
                    .collect()
            })
            .unwrap_or_default();
        fallback.sort();
        fallback
    }

    fn is_data_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| self.data_file_exts.iter().any(|x| x.eq_ignore_ascii_case(e)))
    }

    fn write_sidecar(&self, slug: &str, text_path: &Path, nicks: &[String]) -> Result<()> {
        self.remove_stale_sidecars(slug, text_path)?;
        let mut writer = AtomicTextWriter::new(text_path)?;
        for nick in nicks {
            writer.write_line(nick)?;
        }
        writer.finish()?;
        Ok(())
    }

    /// Removes every sidecar that is not the text of one of `artifacts`, so the
    /// text corpus only holds sources normalized in this run.
    pub fn prune_sidecars(&self, artifacts: &[NormalizedArtifact]) -> Result<Vec<PathBuf>> {
        let dir = &self.layout.normalized_text;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let keep: HashSet<&Path> = artifacts.iter().map(|a| a.text_path.as_path()).collect();
        let mut removed = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && !keep.contains(path.as_path()) {
                fs::remove_file(&path)?;
                debug!("Removed stale sidecar {}", path.display());
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            info!("🗑️  Pruned {} stale text sidecars", removed.len());
        }
        Ok(removed)
    }

    /// Removes sidecars of `slug` written under another priority.
    fn remove_stale_sidecars(&self, slug: &str, keep: &Path) -> Result<()> {
        let dir = &self.layout.normalized_text;
        if !dir.exists() {
            return Ok(());
        }
        let suffix = format!("_{}.txt", slug);
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_same_slug = name
                .strip_suffix(&suffix)
                .map_or(false, |prefix| !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()));
            if is_same_slug && path != keep {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use tempfile::tempdir;

    fn local(slug: &str) -> Source {
        Source {
            slug: slug.to_string(),
            kind: SourceKind::Local,
            reference: None,
            repo: None,
            dataset: None,
            access: None,
            url: None,
            path: None,
            is_email: false,
            keep_original: false,
        }
    }

    fn service(root: &Path) -> NormalizerService {
        NormalizerService::new(
            CacheLayout::new(root.join("raw")),
            false,
            crate::constants::default_data_file_exts(),
        )
    }

    #[test]
    fn test_normalizes_and_dedupes_within_file() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw").join("source_a");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("names.txt"), "Alice\nbob\nalice\n  \n").unwrap();

        let mut source = local("source_a");
        source.keep_original = true;
        let svc = service(dir.path());
        let artifact = svc.normalize_source(0, &source, &raw).unwrap();

        assert_eq!(artifact.values, 2);
        assert!(artifact.keeps_original);
        assert_eq!(artifact::read_column(&artifact.path, NICK_COLUMN).unwrap(), vec!["alice", "bob"]);
        assert_eq!(artifact::read_column(&artifact.path, ORIGINAL_COLUMN).unwrap(), vec!["Alice", "bob"]);
        assert_eq!(fs::read_to_string(&artifact.text_path).unwrap(), "alice\nbob\n");
        assert!(artifact.text_path.ends_with("000000_source_a.txt"));
    }

    #[test]
    fn test_cached_artifact_is_reused() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw").join("s");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("a.txt"), "one\n").unwrap();
        let svc = service(dir.path());
        let source = local("s");
        svc.normalize_source(0, &source, &raw).unwrap();

        fs::write(raw.join("a.txt"), "two\nthree\n").unwrap();
        let again = svc.normalize_source(2, &source, &raw).unwrap();
        assert!(again.reused);
        assert_eq!(again.values, 1);
        assert!(again.text_path.ends_with("000002_s.txt"));
        assert!(!dir.path().join("normalized/text/000000_s.txt").exists());
    }

    #[test]
    fn test_discovery_falls_back_to_top_level_files() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw").join("h");
        fs::create_dir_all(raw.join(".git")).unwrap();
        fs::write(raw.join(".git").join("HEAD.txt"), "ref").unwrap();
        fs::write(raw.join("players"), "steve\n").unwrap();
        fs::write(raw.join(DOWNLOAD_ERROR_LOG), "{}").unwrap();
        let files = service(dir.path()).discover_files(&raw);
        assert_eq!(files, vec![raw.join("players")]);
    }

    #[test]
    fn test_email_source_writes_email_artifact() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw").join("mails");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("list.csv"), "email\nJohn.Doe@Mail.com\njane@x.org\nPlainNick\njohn.doe@mail.com\n").unwrap();
        let mut source = local("mails");
        source.is_email = true;
        let artifact = service(dir.path()).normalize_source(1, &source, &raw).unwrap();

        assert_eq!(
            artifact::read_column(&artifact.path, NICK_COLUMN).unwrap(),
            vec!["john.doe", "jane", "plainnick"]
        );
        let email_path = artifact.email_path.unwrap();
        assert_eq!(
            artifact::read_column(&email_path, EMAIL_COLUMN).unwrap(),
            vec!["john.doe@mail.com", "jane@x.org"]
        );
        assert_eq!(artifact::read_column(&email_path, DOMAIN_COLUMN).unwrap(), vec!["mail.com", "x.org"]);
    }

    #[test]
    fn test_normalize_all_skips_failures_and_keeps_priority() {
        let dir = tempdir().unwrap();
        let raw_root = dir.path().join("raw");
        for (slug, content) in [("b", "Bob\n"), ("a", "Ann\n")] {
            fs::create_dir_all(raw_root.join(slug)).unwrap();
            fs::write(raw_root.join(slug).join("x.txt"), content).unwrap();
        }
        fs::create_dir_all(raw_root.join("empty")).unwrap();

        let sources = vec![local("a"), local("empty"), local("b")];
        let raw_paths = vec![
            ("b".to_string(), raw_root.join("b")),
            ("empty".to_string(), raw_root.join("empty")),
            ("a".to_string(), raw_root.join("a")),
        ];
        let report = service(dir.path()).normalize_all(&sources, &raw_paths);

        let slugs: Vec<_> = report.artifacts.iter().map(|a| a.slug.as_str()).collect();
        assert_eq!(slugs, vec!["a", "b"]);
        assert_eq!(report.artifacts[1].priority, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].slug, "empty");
        assert!(dir.path().join("logs").join("errors.log").exists());
    }

    #[test]
    fn test_zip_archive_is_extracted_before_discovery() {
        use std::io::Write;
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw").join("z");
        fs::create_dir_all(&raw).unwrap();
        let mut writer = zip::ZipWriter::new(fs::File::create(raw.join("dump.zip")).unwrap());
        writer
            .start_file("inner/users.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"user,id\nZoe,1\n").unwrap();
        writer.finish().unwrap();

        let artifact = service(dir.path()).normalize_source(0, &local("z"), &raw).unwrap();
        assert_eq!(artifact::read_column(&artifact.path, NICK_COLUMN).unwrap(), vec!["zoe"]);
    }
}

//! Composes the stage services into runnable pipelines.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::acquisition::{DownloadReport, Downloader};
use crate::cleanup::{self, CleanReport};
use crate::config::{AggregatorConfig, SourceKind};
use crate::constants::STRICT_CLEAN_ALLOW_LIST;
use crate::dedupe::{DedupeMode, DedupeReport, DeduplicatorService};
use crate::error::{AggregatorError, Result};
use crate::export::{ExportFormat, ExporterService, Partition};
use crate::incident;
use crate::layout::CacheLayout;
use crate::normalize::{NormalizeReport, NormalizedArtifact, NormalizerService};
use crate::splitter::{SplitReport, SplitterService};

#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub sources_downloaded: usize,
    pub entries_normalized: u64,
    pub chunks_written: usize,
    pub entries_deduped: u64,
    pub entries_exported: u64,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📊 Run statistics")?;
        writeln!(f, "   Sources downloaded: {}", self.sources_downloaded)?;
        writeln!(f, "   Entries normalized: {}", self.entries_normalized)?;
        writeln!(f, "   Chunks written:     {}", self.chunks_written)?;
        writeln!(f, "   Unique entries:     {}", self.entries_deduped)?;
        write!(f, "   Entries exported:   {}", self.entries_exported)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub files: Vec<PathBuf>,
    pub entries: u64,
}

impl ExportSummary {
    fn add(&mut self, path: PathBuf, entries: u64) {
        self.files.push(path);
        self.entries += entries;
    }
}

/// Runs blocking stage work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AggregatorError::Config(format!("stage task failed: {}", e)))?
}

pub struct Orchestrator {
    config: AggregatorConfig,
    layout: CacheLayout,
    downloader: Downloader,
    normalizer: Arc<NormalizerService>,
    splitter: Arc<SplitterService>,
    deduplicator: Arc<DeduplicatorService>,
    exporter: Arc<ExporterService>,
    stats: RunStats,
    raw_paths: Vec<(String, PathBuf)>,
    artifacts: Vec<NormalizedArtifact>,
    deduped: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(config: AggregatorConfig, force: bool) -> Result<Self> {
        let force = force || config.defaults.force;
        let layout = CacheLayout::new(&config.defaults.cache_dir);
        layout.ensure()?;
        let d = &config.defaults;
        Ok(Self {
            downloader: Downloader::new(&config, layout.clone(), force)?,
            normalizer: Arc::new(NormalizerService::new(layout.clone(), force, d.data_file_exts.clone())),
            splitter: Arc::new(SplitterService::new(d.split_max_lines)),
            deduplicator: Arc::new(DeduplicatorService::new(layout.clone(), force, d.dedupe_batch_size)),
            exporter: Arc::new(ExporterService::new(layout.clone(), d.export_chunk_size)),
            stats: RunStats::default(),
            raw_paths: Vec::new(),
            artifacts: Vec::new(),
            deduped: None,
            layout,
            config,
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    fn fail(&self, phase: &str, e: AggregatorError) -> AggregatorError {
        error!(phase, "Stage failed: {}", e);
        incident::record(&self.layout.stage_error_log(), phase, None, &e);
        e
    }

    pub async fn download(&mut self) -> Result<DownloadReport> {
        let report = self.downloader.download_all().await?;
        if report.succeeded.is_empty() {
            return Err(AggregatorError::no_valid_data("download"));
        }
        self.stats.sources_downloaded = report.succeeded.len();
        self.raw_paths = report.succeeded.clone();
        Ok(report)
    }

    /// Raw locations known without downloading: the configured path for local
    /// sources, `raw/<slug>` for everything already cached.
    fn cached_raw_paths(&self) -> Vec<(String, PathBuf)> {
        self.config
            .sources
            .iter()
            .filter_map(|s| {
                let path = match s.kind {
                    SourceKind::Local => s
                        .url
                        .as_deref()
                        .or(s.path.as_deref())
                        .map(PathBuf::from)
                        .unwrap_or_else(|| self.layout.raw_source(&s.slug)),
                    _ => self.layout.raw_source(&s.slug),
                };
                path.exists().then(|| (s.slug.clone(), path))
            })
            .collect()
    }

    pub async fn normalize(&mut self) -> Result<NormalizeReport> {
        let raw_paths = if self.raw_paths.is_empty() {
            self.cached_raw_paths()
        } else {
            self.raw_paths.clone()
        };
        let normalizer = Arc::clone(&self.normalizer);
        let sources = self.config.sources.clone();
        let report = blocking(move || {
            let report = normalizer.normalize_all(&sources, &raw_paths);
            if !report.artifacts.is_empty() {
                normalizer.prune_sidecars(&report.artifacts)?;
            }
            Ok(report)
        })
        .await?;
        if report.artifacts.is_empty() {
            return Err(AggregatorError::no_valid_data("normalize"));
        }
        self.stats.entries_normalized = report.total_values() as u64;
        self.artifacts = report.artifacts.clone();
        Ok(report)
    }

    async fn ensure_artifacts(&mut self) -> Result<()> {
        if self.artifacts.is_empty() {
            self.normalize().await?;
        }
        Ok(())
    }

    /// Splits the per-source text sidecars of the current sources into `output/splits`.
    pub async fn split_normalized(&mut self, max_lines: Option<usize>) -> Result<SplitReport> {
        self.ensure_artifacts().await?;
        let input = self.layout.normalized_text.clone();
        let output = self.layout.splits.clone();
        let report = match max_lines {
            Some(lines) => blocking(move || crate::splitter::split(&input, &output, lines)).await?,
            None => {
                let splitter = Arc::clone(&self.splitter);
                blocking(move || splitter.split(&input, &output)).await?
            }
        };
        if report.chunks.is_empty() {
            return Err(AggregatorError::no_valid_data("split"));
        }
        self.stats.chunks_written = report.chunks.len();
        Ok(report)
    }

    pub async fn deduplicate(&mut self, mode: DedupeMode) -> Result<DedupeReport> {
        let deduplicator = Arc::clone(&self.deduplicator);
        let report = match mode {
            DedupeMode::Chunks => {
                let splits = self.layout.splits.clone();
                blocking(move || deduplicator.deduplicate_chunks(&splits)).await?
            }
            DedupeMode::Full | DedupeMode::HighVolume => {
                self.ensure_artifacts().await?;
                let artifacts = self.artifacts.clone();
                blocking(move || match mode {
                    DedupeMode::Full => deduplicator.deduplicate_all(&artifacts),
                    _ => deduplicator.deduplicate_high_volume(&artifacts),
                })
                .await?
            }
        };
        self.retire_other_dedupe_outputs(&report.path)?;
        self.stats.entries_deduped = report.unique;
        self.deduped = Some(report.path.clone());
        Ok(report)
    }

    /// Removes the output of the other dedupe modes; exports read whichever
    /// deduplicated artifact remains.
    fn retire_other_dedupe_outputs(&self, current: &Path) -> Result<()> {
        for other in [self.layout.deduped_chunks(), self.layout.all_deduped()] {
            if other != current && other.exists() {
                info!("Removing superseded {}", other.display());
                std::fs::remove_file(&other)?;
            }
        }
        Ok(())
    }

    /// The deduplicated artifact exports read: the output of this session's
    /// last dedupe, otherwise the most recently written one on disk.
    pub fn deduped_path(&self) -> Result<PathBuf> {
        if let Some(path) = self.deduped.as_ref().filter(|p| p.exists()) {
            return Ok(path.clone());
        }
        [self.layout.deduped_chunks(), self.layout.all_deduped()]
            .into_iter()
            .filter_map(|p| {
                let modified = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                Some((modified, p))
            })
            .max_by_key(|(modified, _)| *modified)
            .map(|(_, p)| p)
            .ok_or_else(|| AggregatorError::no_valid_data("export"))
    }

    #[instrument(skip(self))]
    pub async fn export(&mut self, format: ExportFormat, chunk_size: Option<usize>) -> Result<ExportSummary> {
        let deduped = self.deduped_path()?;
        let chunk_size = chunk_size.unwrap_or_else(|| self.exporter.chunk_size());
        let mut summary = ExportSummary::default();

        let wants = |f: ExportFormat| format == f || format == ExportFormat::All;

        if wants(ExportFormat::Streaming) {
            let exporter = Arc::clone(&self.exporter);
            let input = deduped.clone();
            let report = blocking(move || exporter.export_streaming(&input, chunk_size)).await?;
            summary.add(report.path, report.entries);
        }
        if wants(ExportFormat::Original) {
            self.ensure_artifacts().await?;
            if format == ExportFormat::Original || self.artifacts.iter().any(|a| a.keeps_original) {
                let exporter = Arc::clone(&self.exporter);
                let input = deduped.clone();
                let artifacts = self.artifacts.clone();
                let report = blocking(move || exporter.export_with_original(&input, &artifacts)).await?;
                summary.add(report.path, report.entries);
            }
        }
        if wants(ExportFormat::Emails) {
            let exporter = Arc::clone(&self.exporter);
            let input = deduped.clone();
            match blocking(move || exporter.export_emails_and_nicknames(&input)).await {
                Ok(export) => {
                    summary.entries += (export.emails + export.combined) as u64;
                    summary.files.extend(export.files);
                }
                Err(AggregatorError::NoValidData { stage }) if format == ExportFormat::All => {
                    warn!("Skipping email export: no valid data for '{}'", stage);
                }
                Err(e) => return Err(e),
            }
        }
        let partitions: Vec<Partition> = match format {
            ExportFormat::All => Partition::ALL.to_vec(),
            ExportFormat::Nicknames => vec![Partition::Nicknames],
            ExportFormat::Passwords => vec![Partition::Passwords],
            _ => Vec::new(),
        };
        if !partitions.is_empty() {
            for report in self.export_partitions(&deduped, partitions).await? {
                summary.add(report.path, report.entries);
            }
        }
        if wants(ExportFormat::Final) {
            let lines = self.config.defaults.final_chunk_lines;
            summary.files.extend(self.split_final(Some(lines)).await?);
        }

        self.stats.entries_exported = summary.entries;
        info!("📤 Export wrote {} files", summary.files.len());
        Ok(summary)
    }

    async fn export_partitions(&self, deduped: &Path, partitions: Vec<Partition>) -> Result<Vec<crate::export::ExportReport>> {
        let exporter = Arc::clone(&self.exporter);
        let input = deduped.to_path_buf();
        blocking(move || exporter.export_partitions(&input, &partitions)).await
    }

    /// Splits the deduplicated set into `output/final/chunk_NNN.txt`.
    pub async fn split_final(&mut self, lines_per_file: Option<usize>) -> Result<Vec<PathBuf>> {
        let deduped = self.deduped_path()?;
        let lines = lines_per_file.unwrap_or(self.config.defaults.final_chunk_lines);
        let exporter = Arc::clone(&self.exporter);
        blocking(move || exporter.export_final_chunks(&deduped, lines)).await
    }

    /// Download, normalize, split, chunk dedupe, partition export and final
    /// split, stopping at the first step that produced nothing.
    #[instrument(skip(self))]
    pub async fn run_automated(&mut self, only: Option<Partition>) -> Result<RunStats> {
        info!("🚀 Automated run ({})", only.map_or("all partitions", |p| p.as_str()));

        self.download().await.map_err(|e| self.fail("download", e))?;
        self.normalize().await.map_err(|e| self.fail("normalize", e))?;
        self.split_normalized(None).await.map_err(|e| self.fail("split", e))?;
        self.deduplicate(DedupeMode::Chunks)
            .await
            .map_err(|e| self.fail("deduplicate", e))?;

        let deduped = self.deduped_path().map_err(|e| self.fail("export", e))?;
        let partitions = only.map_or_else(|| Partition::ALL.to_vec(), |p| vec![p]);
        let reports = self
            .export_partitions(&deduped, partitions)
            .await
            .map_err(|e| self.fail("export", e))?;
        self.stats.entries_exported = reports.iter().map(|r| r.entries).sum();
        if self.stats.entries_exported == 0 {
            let e = self.fail("export", AggregatorError::no_valid_data("export"));
            return Err(e);
        }

        let chunks = self.split_final(None).await.map_err(|e| self.fail("final split", e))?;
        info!("🏁 Automated run finished with {} final chunks", chunks.len());
        Ok(self.stats.clone())
    }

    pub fn clean_cache(&self) -> Result<Vec<PathBuf>> {
        let slugs: Vec<String> = self.config.sources.iter().map(|s| s.slug.clone()).collect();
        cleanup::clean_cache(&self.layout.raw, &slugs)
    }

    pub fn clean_strict(&self, root: &Path) -> Result<CleanReport> {
        cleanup::strict_clean(root, STRICT_CLEAN_ALLOW_LIST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn orchestrator(root: &Path, sources: &[(&str, &str, bool)]) -> Orchestrator {
        let mut toml = format!("[defaults]\ncache_dir = \"{}\"\nfinal_chunk_lines = 2\n", root.join("data/raw").display());
        for (slug, content, keep_original) in sources {
            let dir = root.join("inputs").join(slug);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("values.txt"), content).unwrap();
            toml.push_str(&format!(
                "\n[[sources]]\nslug = \"{}\"\nkind = \"local\"\npath = \"{}\"\nkeep_original = {}\n",
                slug,
                dir.display(),
                keep_original
            ));
        }
        Orchestrator::new(AggregatorConfig::from_toml(&toml).unwrap(), false).unwrap()
    }

    #[tokio::test]
    async fn test_automated_run_produces_partitions_and_final_chunks() {
        let dir = tempdir().unwrap();
        let mut orch = orchestrator(
            dir.path(),
            &[("a", "Alice\nbob\nalice\n", false), ("b", "ALICE\ncarol\npassword123\n", false)],
        );
        let stats = orch.run_automated(None).await.unwrap();
        assert_eq!(stats.sources_downloaded, 2);
        assert_eq!(stats.entries_deduped, 4);

        let nicknames = fs::read_to_string(orch.layout().partition_dir("nicknames").join("nicknames.txt")).unwrap();
        assert_eq!(nicknames, "alice\nbob\ncarol\npassword123\n");
        let finals: Vec<String> = crate::dedupe::list_chunks(&orch.layout().final_chunks)
            .unwrap()
            .iter()
            .map(|p| fs::read_to_string(p).unwrap())
            .collect();
        assert_eq!(finals, vec!["alice,\nbob,\n", "carol,\npassword123\n"]);
    }

    #[tokio::test]
    async fn test_export_without_dedupe_is_no_valid_data() {
        let dir = tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), &[("a", "x\n", false)]);
        let err = orch.export(ExportFormat::Streaming, None).await.unwrap_err();
        assert!(matches!(err, AggregatorError::NoValidData { .. }));
    }

    #[tokio::test]
    async fn test_full_dedupe_then_original_export() {
        let dir = tempdir().unwrap();
        let mut orch = orchestrator(
            dir.path(),
            &[("a", "Alice\nbob\nalice\n", true), ("b", "ALICE\ncarol\n", true)],
        );
        let report = orch.deduplicate(DedupeMode::Full).await.unwrap();
        assert_eq!(report.unique, 3);
        let summary = orch.export(ExportFormat::Original, None).await.unwrap();
        let originals = crate::artifact::read_column(&summary.files[0], crate::constants::ORIGINAL_COLUMN).unwrap();
        assert_eq!(originals, vec!["Alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_failed_stage_is_recorded() {
        let dir = tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), &[("a", "", false)]);
        assert!(orch.run_automated(Some(Partition::Nicknames)).await.is_err());
        let incidents = incident::read_all(&orch.layout().stage_error_log()).unwrap();
        assert!(incidents.iter().any(|i| i.phase == "normalize"));
    }
}

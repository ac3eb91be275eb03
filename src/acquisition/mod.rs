//! Acquisition stage: brings every configured source into `raw/<slug>`.

pub mod fetchers;

pub use fetchers::{Fetcher, GitFetcher, HttpFetcher, KaggleFetcher, LocalFetcher, WikidataFetcher};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::cleanup;
use crate::config::{AggregatorConfig, Source, SourceKind};
use crate::error::{AggregatorError, Result};
use crate::incident;
use crate::layout::CacheLayout;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct FailedSource {
    pub slug: String,
    pub reference: Option<String>,
    pub locator: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub succeeded: Vec<(String, PathBuf)>,
    pub failed: Vec<FailedSource>,
}

/// True when `dir` holds at least one file with a recognized data extension.
pub fn has_valid_data_files(dir: &Path, exts: &[String]) -> bool {
    if !dir.is_dir() {
        return false;
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .map_or(false, |x| {
                    exts.iter()
                        .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(x))
                })
        })
}

fn has_any_file(path: &Path) -> bool {
    if path.is_file() {
        return true;
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file())
}

pub struct Downloader {
    sources: Vec<Source>,
    layout: CacheLayout,
    semaphore: Arc<Semaphore>,
    force: bool,
    data_file_exts: Vec<String>,
    http: HttpFetcher,
}

impl Downloader {
    pub fn new(config: &AggregatorConfig, layout: CacheLayout, force: bool) -> Result<Self> {
        Ok(Self {
            sources: config.sources.clone(),
            layout,
            semaphore: Arc::new(Semaphore::new(config.defaults.workers.max(1))),
            force,
            data_file_exts: config.defaults.data_file_exts.clone(),
            http: HttpFetcher::new()?,
        })
    }

    /// Downloads every source one at a time, in priority order. A failing
    /// source is logged to `raw/<slug>/download_error.log` and skipped.
    /// Ctrl-C aborts with `Interrupted`.
    #[instrument(skip(self), fields(sources = self.sources.len()))]
    pub async fn download_all(&self) -> Result<DownloadReport> {
        let started = Instant::now();
        let mut report = DownloadReport::default();
        fs::create_dir_all(&self.layout.raw)?;

        for source in &self.sources {
            let result = tokio::select! {
                result = self.download_source(source) => result,
                _ = tokio::signal::ctrl_c() => {
                    warn!(slug = %source.slug, "Interrupted during download");
                    return Err(AggregatorError::Interrupted);
                }
            };
            match result {
                Ok(path) => {
                    info!(slug = %source.slug, "✅ Ready at {}", path.display());
                    metrics::record_download(true);
                    report.succeeded.push((source.slug.clone(), path));
                }
                Err(e) => {
                    error!(slug = %source.slug, "❌ Download failed: {}", e);
                    metrics::record_download(false);
                    incident::record(&self.layout.download_error_log(&source.slug), "download", Some(&source.slug), &e);
                    report.failed.push(FailedSource {
                        slug: source.slug.clone(),
                        reference: source.reference.clone(),
                        locator: source.locator(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "📥 Downloads finished: {} ok, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        for failed in &report.failed {
            warn!(
                slug = %failed.slug,
                reference = failed.reference.as_deref().unwrap_or("-"),
                locator = %failed.locator,
                "Failed source: {}",
                failed.message
            );
        }
        metrics::record_stage_duration("download", started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Fetches one source, reusing a cached copy unless `force` is set.
    #[instrument(skip(self, source), fields(slug = %source.slug, kind = source.kind.as_str()))]
    pub async fn download_source(&self, source: &Source) -> Result<PathBuf> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AggregatorError::Config("download semaphore closed".into()))?;
        let dest = self.layout.raw_source(&source.slug);

        if source.kind == SourceKind::Local {
            return LocalFetcher.fetch(source, &dest).await;
        }
        if dest.exists() && !self.force && has_valid_data_files(&dest, &self.data_file_exts) {
            debug!("Using cached data in {}", dest.display());
            return Ok(dest);
        }
        if dest.exists() && !cleanup::force_remove(&dest) {
            return Err(AggregatorError::source(
                &source.slug,
                format!("could not clear stale cache {}", dest.display()),
            ));
        }
        fs::create_dir_all(&dest)?;

        let path = match source.kind {
            SourceKind::Git => GitFetcher.fetch(source, &dest).await?,
            SourceKind::Kaggle => KaggleFetcher.fetch(source, &dest).await?,
            SourceKind::Http => self.http.fetch(source, &dest).await?,
            SourceKind::Wikidata => WikidataFetcher { http: &self.http }.fetch(source, &dest).await?,
            SourceKind::Local => LocalFetcher.fetch(source, &dest).await?,
        };
        if !has_any_file(&path) {
            return Err(AggregatorError::source(&source.slug, "download produced no files"));
        }
        Ok(path)
    }

    /// Sources the downloader knows about, in priority order.
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregatorConfig;
    use tempfile::tempdir;

    fn config(root: &Path, body: &str) -> AggregatorConfig {
        let toml = format!(
            "[defaults]\ncache_dir = \"{}\"\n\n{}",
            root.join("raw").display(),
            body
        );
        AggregatorConfig::from_toml(&toml).unwrap()
    }

    #[test]
    fn test_has_valid_data_files() {
        let dir = tempdir().unwrap();
        let exts = crate::constants::default_data_file_exts();
        assert!(!has_valid_data_files(dir.path(), &exts));
        fs::write(dir.path().join("download_error.log"), "{}").unwrap();
        assert!(!has_valid_data_files(dir.path(), &exts));
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("names.CSV"), "a").unwrap();
        assert!(has_valid_data_files(dir.path(), &exts));
    }

    #[tokio::test]
    async fn test_cached_http_source_is_not_refetched() {
        let dir = tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "[[sources]]\nslug = \"cached\"\nkind = \"http\"\nurl = \"http://127.0.0.1:9/never.txt\"\n",
        );
        let layout = CacheLayout::new(&cfg.defaults.cache_dir);
        let raw = layout.raw_source("cached");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("names.txt"), "a\n").unwrap();

        let downloader = Downloader::new(&cfg, layout, false).unwrap();
        let report = downloader.download_all().await.unwrap();
        assert_eq!(report.succeeded, vec![("cached".to_string(), raw)]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_logged() {
        let dir = tempdir().unwrap();
        let local_dir = dir.path().join("local");
        fs::create_dir_all(&local_dir).unwrap();
        let cfg = config(
            dir.path(),
            &format!(
                "[[sources]]\nslug = \"missing\"\nkind = \"local\"\npath = \"{}\"\n\n[[sources]]\nslug = \"here\"\nkind = \"local\"\npath = \"{}\"\n",
                dir.path().join("nope").display(),
                local_dir.display()
            ),
        );
        let layout = CacheLayout::new(&cfg.defaults.cache_dir);
        let downloader = Downloader::new(&cfg, layout.clone(), false).unwrap();
        let report = downloader.download_all().await.unwrap();

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].slug, "missing");
        let incidents = incident::read_all(&layout.download_error_log("missing")).unwrap();
        assert_eq!(incidents[0].phase, "download");
        assert_eq!(incidents[0].kind, "Source");
    }
}

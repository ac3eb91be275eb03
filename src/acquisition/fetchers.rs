use async_trait::async_trait;
use reqwest::StatusCode;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive;
use crate::config::Source;
use crate::error::{AggregatorError, Result};

pub const PARANAMES_ZENODO_URL: &str = "https://zenodo.org/records/5596875/files/paranames-1.0.zip";
const USER_AGENT: &str = concat!("nick_aggregator/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(180);
const HTTP_ATTEMPTS: u32 = 3;
const HTTP_BACKOFF: Duration = Duration::from_secs(5);

/// Fetches one source into `dest` and returns the directory (or file) the
/// normalizer should read.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source: &Source, dest: &Path) -> Result<PathBuf>;
}

async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| AggregatorError::Command {
            program: program.to_string(),
            message: e.to_string(),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AggregatorError::Command {
            program: program.to_string(),
            message: format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

async fn extract_in_background(dest: PathBuf) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || archive::extract_all(&dest))
        .await
        .map_err(|e| AggregatorError::Archive(format!("extraction task failed: {}", e)))?
}

/// `owner/name` becomes a GitHub clone URL; full URLs pass through.
pub fn repo_url(repo: &str) -> String {
    if repo.contains("://") || repo.starts_with("git@") {
        repo.to_string()
    } else {
        format!("https://github.com/{}.git", repo.trim_end_matches(".git"))
    }
}

/// Copies a checkout into `dest`, leaving `.git` behind.
pub fn copy_tree(from: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(from)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
    {
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

pub struct GitFetcher;

#[async_trait]
impl Fetcher for GitFetcher {
    async fn fetch(&self, source: &Source, dest: &Path) -> Result<PathBuf> {
        let repo = source
            .repo
            .as_deref()
            .ok_or_else(|| AggregatorError::source(&source.slug, "git source without repo"))?;
        let url = repo_url(repo);
        let checkout_root = tempfile::tempdir()?;
        let checkout = checkout_root.path().join("repo");
        let checkout_str = checkout.to_string_lossy().into_owned();

        let mut cloned = false;
        if let Some(branch) = source.reference.as_deref().filter(|b| !b.contains(' ')) {
            match run_command("git", &["clone", "--depth=1", "--branch", branch, &url, &checkout_str]).await {
                Ok(()) => cloned = true,
                Err(e) => warn!(slug = %source.slug, "Clone of branch '{}' failed, retrying default branch: {}", branch, e),
            }
        }
        if !cloned {
            if checkout.exists() {
                fs::remove_dir_all(&checkout)?;
            }
            run_command("git", &["clone", "--depth=1", &url, &checkout_str]).await?;
        }

        let dest_owned = dest.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&checkout, &dest_owned))
            .await
            .map_err(|e| AggregatorError::source(&source.slug, format!("copy task failed: {}", e)))??;
        info!(slug = %source.slug, "Cloned {} ({} files)", url, copied);
        Ok(dest.to_path_buf())
    }
}

pub struct KaggleFetcher;

#[async_trait]
impl Fetcher for KaggleFetcher {
    async fn fetch(&self, source: &Source, dest: &Path) -> Result<PathBuf> {
        let dataset = source
            .dataset
            .as_deref()
            .ok_or_else(|| AggregatorError::source(&source.slug, "kaggle source without dataset"))?;
        fs::create_dir_all(dest)?;
        let dest_str = dest.to_string_lossy().into_owned();
        run_command("kaggle", &["datasets", "download", "-p", &dest_str, "--unzip", dataset]).await?;
        extract_in_background(dest.to_path_buf()).await?;
        Ok(dest.to_path_buf())
    }
}

/// File name for a downloaded URL: its last path segment, else `<slug>_download.dat`.
pub fn file_name_from_url(url: &str, slug: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = path.split_once("://").map_or(path, |(_, rest)| rest);
    match after_scheme.split_once('/') {
        Some((_, rest)) => match rest.rsplit('/').next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}_download.dat", slug),
        },
        None => format!("{}_download.dat", slug),
    }
}

/// GitHub raw URLs on `master` are retried once on `main`.
pub fn main_branch_fallback(url: &str) -> Option<String> {
    (url.contains("github") && url.contains("/master/")).then(|| url.replacen("/master/", "/main/", 1))
}

pub struct HttpFetcher {
    client: reqwest::Client,
    attempts: u32,
    backoff: Duration,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            attempts: HTTP_ATTEMPTS,
            backoff: HTTP_BACKOFF,
        })
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Streams `url` into `target`. Returns the final HTTP status on failure
    /// so the caller can decide on a branch fallback.
    async fn download_once(&self, url: &str, target: &Path) -> std::result::Result<u64, (Option<StatusCode>, AggregatorError)> {
        let response = self.client.get(url).send().await.map_err(|e| (e.status(), e.into()))?;
        let status = response.status();
        let mut response = response.error_for_status().map_err(|e| (Some(status), e.into()))?;

        let mut file = tokio::fs::File::create(target).await.map_err(|e| (None, e.into()))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| (None, e.into()))? {
            file.write_all(&chunk).await.map_err(|e| (None, e.into()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| (None, e.into()))?;
        Ok(written)
    }

    async fn download_with_retry(&self, url: &str, target: &Path) -> (Option<StatusCode>, Result<u64>) {
        let mut last_status = None;
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.download_once(url, target).await {
                Ok(bytes) => return (None, Ok(bytes)),
                Err((status, e)) => {
                    warn!("Download of {} failed (attempt {}/{}): {}", url, attempt, self.attempts, e);
                    last_status = status;
                    last_error = Some(e);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        let error = last_error.unwrap_or_else(|| AggregatorError::Config(format!("no attempt made for {}", url)));
        (last_status, Err(error))
    }

    pub async fn download_url(&self, url: &str, slug: &str, dest: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest)?;
        let target = dest.join(file_name_from_url(url, slug));
        let (status, result) = self.download_with_retry(url, &target).await;
        let bytes = match (result, status) {
            (Ok(bytes), _) => bytes,
            (Err(e), Some(s)) if s == StatusCode::NOT_FOUND || s == StatusCode::FORBIDDEN => match main_branch_fallback(url) {
                Some(fallback) => {
                    info!(slug, "Retrying on main branch: {}", fallback);
                    let target = dest.join(file_name_from_url(&fallback, slug));
                    let bytes = self.download_once(&fallback, &target).await.map_err(|(_, e)| e)?;
                    debug!(slug, "Downloaded {} bytes from fallback", bytes);
                    bytes
                }
                None => return Err(e),
            },
            (Err(e), _) => return Err(e),
        };
        info!(slug, "Downloaded {} ({} bytes)", url, bytes);
        extract_in_background(dest.to_path_buf()).await?;
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, source: &Source, dest: &Path) -> Result<PathBuf> {
        let url = source
            .url
            .as_deref()
            .ok_or_else(|| AggregatorError::source(&source.slug, "http source without url"))?;
        self.download_url(url, &source.slug, dest).await
    }
}

/// Wikidata dumps resolve to a download URL and go through HTTP.
pub struct WikidataFetcher<'a> {
    pub http: &'a HttpFetcher,
}

pub fn wikidata_url(source: &Source) -> Result<String> {
    match (source.url.as_deref(), source.access.as_deref()) {
        (Some(url), _) => Ok(url.to_string()),
        (None, Some("zenodo")) => Ok(PARANAMES_ZENODO_URL.to_string()),
        (None, access) => Err(AggregatorError::source(
            &source.slug,
            format!("unsupported wikidata access {:?}", access),
        )),
    }
}

#[async_trait]
impl Fetcher for WikidataFetcher<'_> {
    async fn fetch(&self, source: &Source, dest: &Path) -> Result<PathBuf> {
        let url = wikidata_url(source)?;
        self.http.download_url(&url, &source.slug, dest).await
    }
}

/// Local sources point at an existing path; nothing is copied.
pub struct LocalFetcher;

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(&self, source: &Source, dest: &Path) -> Result<PathBuf> {
        let path = source
            .url
            .as_deref()
            .or(source.path.as_deref())
            .map(PathBuf::from)
            .unwrap_or_else(|| dest.to_path_buf());
        if path.exists() {
            Ok(path)
        } else {
            Err(AggregatorError::source(
                &source.slug,
                format!("local path {} does not exist", path.display()),
            ))
        }
    }
}

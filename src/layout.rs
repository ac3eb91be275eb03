use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::Result;

/// Stage-keyed directory tree rooted next to the raw cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    pub raw: PathBuf,
    pub normalized: PathBuf,
    pub normalized_emails: PathBuf,
    pub normalized_text: PathBuf,
    pub deduped: PathBuf,
    pub output: PathBuf,
    pub splits: PathBuf,
    pub final_chunks: PathBuf,
    pub logs: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        let raw = cache_dir.as_ref().to_path_buf();
        let root = raw
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let normalized = root.join(NORMALIZED_DIR);
        let output = root.join(OUTPUT_DIR);
        Self {
            normalized_emails: normalized.join(EMAILS_DIR),
            normalized_text: normalized.join(TEXT_DIR),
            normalized,
            deduped: root.join(DEDUPED_DIR),
            splits: output.join(SPLITS_DIR),
            final_chunks: output.join(FINAL_DIR),
            output,
            logs: root.join(LOGS_DIR),
            raw,
        }
    }

    pub fn raw_source(&self, slug: &str) -> PathBuf {
        self.raw.join(slug)
    }

    pub fn normalized_artifact(&self, slug: &str) -> PathBuf {
        self.normalized.join(format!("{}.parquet", slug))
    }

    pub fn email_artifact(&self, slug: &str) -> PathBuf {
        self.normalized_emails.join(format!("{}.parquet", slug))
    }

    /// Text sidecar; the priority prefix keeps a sorted walk in priority order.
    pub fn text_sidecar(&self, priority: usize, slug: &str) -> PathBuf {
        self.normalized_text.join(format!("{:06}_{}.txt", priority, slug))
    }

    pub fn all_deduped(&self) -> PathBuf {
        self.deduped.join(ALL_DEDUPED_FILE)
    }

    pub fn deduped_chunks(&self) -> PathBuf {
        self.deduped.join(DEDUPED_CHUNKS_FILE)
    }

    pub fn partition_dir(&self, name: &str) -> PathBuf {
        self.output.join(name)
    }

    pub fn download_error_log(&self, slug: &str) -> PathBuf {
        self.raw_source(slug).join(DOWNLOAD_ERROR_LOG)
    }

    pub fn stage_error_log(&self) -> PathBuf {
        self.logs.join(STAGE_ERROR_LOG)
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.raw,
            &self.normalized,
            &self.normalized_emails,
            &self.normalized_text,
            &self.deduped,
            &self.output,
            &self.logs,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

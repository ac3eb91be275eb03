use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{
    default_data_file_exts, DEFAULT_DEDUPE_BATCH_SIZE, DEFAULT_EXPORT_CHUNK_SIZE,
    DEFAULT_FINAL_CHUNK_LINES, DEFAULT_SPLIT_MAX_LINES, DEFAULT_WORKERS,
};
use crate::error::{AggregatorError, Result};

/// Top level configuration. The order of `sources` is the deduplication priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub defaults: Defaults,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub cache_dir: PathBuf,
    pub force: bool,
    pub workers: usize,
    pub data_file_exts: Vec<String>,
    pub split_max_lines: usize,
    pub dedupe_batch_size: usize,
    pub export_chunk_size: usize,
    pub final_chunk_lines: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/raw"),
            force: false,
            workers: DEFAULT_WORKERS,
            data_file_exts: default_data_file_exts(),
            split_max_lines: DEFAULT_SPLIT_MAX_LINES,
            dedupe_batch_size: DEFAULT_DEDUPE_BATCH_SIZE,
            export_chunk_size: DEFAULT_EXPORT_CHUNK_SIZE,
            final_chunk_lines: DEFAULT_FINAL_CHUNK_LINES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Git,
    Http,
    Kaggle,
    Wikidata,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Git => "git",
            SourceKind::Http => "http",
            SourceKind::Kaggle => "kaggle",
            SourceKind::Wikidata => "wikidata",
            SourceKind::Local => "local",
        }
    }
}

/// A configured data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub slug: String,
    pub kind: SourceKind,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub is_email: bool,
    #[serde(default)]
    pub keep_original: bool,
}

impl Source {
    /// Human readable locator, used in failure summaries.
    pub fn locator(&self) -> String {
        match self.kind {
            SourceKind::Git => self
                .repo
                .as_ref()
                .map(|r| format!("https://github.com/{}", r))
                .unwrap_or_default(),
            SourceKind::Kaggle => self
                .dataset
                .as_ref()
                .map(|d| format!("https://www.kaggle.com/datasets/{}", d))
                .unwrap_or_default(),
            SourceKind::Wikidata => self
                .url
                .clone()
                .or_else(|| self.access.as_ref().map(|a| format!("wikidata:{}", a)))
                .unwrap_or_default(),
            SourceKind::Http | SourceKind::Local => self
                .url
                .clone()
                .or_else(|| self.path.clone())
                .unwrap_or_default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.slug.is_empty() {
            return Err(AggregatorError::Config("source slug must not be empty".into()));
        }
        if !self
            .slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(AggregatorError::Config(format!(
                "source slug '{}' may only contain letters, digits, '_', '-' and '.'",
                self.slug
            )));
        }
        let missing = |field: &str| {
            AggregatorError::Config(format!(
                "source '{}' of kind {} requires '{}'",
                self.slug,
                self.kind.as_str(),
                field
            ))
        };
        match self.kind {
            SourceKind::Git if self.repo.is_none() => Err(missing("repo")),
            SourceKind::Kaggle if self.dataset.is_none() => Err(missing("dataset")),
            SourceKind::Http if self.url.is_none() => Err(missing("url")),
            SourceKind::Wikidata => match (self.access.as_deref(), &self.url) {
                (_, Some(_)) | (Some("zenodo"), None) => Ok(()),
                (Some(other), None) => Err(AggregatorError::Config(format!(
                    "source '{}': unsupported wikidata access '{}'",
                    self.slug, other
                ))),
                (None, None) => Err(missing("access")),
            },
            SourceKind::Local if self.url.is_none() && self.path.is_none() => {
                Err(missing("path"))
            }
            _ => Ok(()),
        }
    }
}

impl AggregatorConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AggregatorError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AggregatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(AggregatorError::Config("no sources configured".into()));
        }
        let d = &self.defaults;
        for (name, value) in [
            ("workers", d.workers),
            ("split_max_lines", d.split_max_lines),
            ("dedupe_batch_size", d.dedupe_batch_size),
            ("export_chunk_size", d.export_chunk_size),
            ("final_chunk_lines", d.final_chunk_lines),
        ] {
            if value == 0 {
                return Err(AggregatorError::Config(format!("{} must be at least 1", name)));
            }
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.slug.as_str()) {
                return Err(AggregatorError::Config(format!(
                    "duplicate source slug '{}'",
                    source.slug
                )));
            }
        }
        Ok(())
    }

    pub fn slugs(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.slug.as_str()).collect()
    }
}

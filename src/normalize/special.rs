use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::text::normalize_strict;
use crate::error::Result;

static MARKDOWN_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(.*?)\]\((https?://[^\)]+)\)").expect("valid markdown link regex"));

/// Sources whose raw layout needs bespoke extraction, keyed by slug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialSource {
    /// Link labels of a curated README list.
    AwesomeWordlists,
    /// Paired `male.txt` / `female.txt` name lists.
    JapaneseNames,
    /// `epicube-players` followed by `hypixel-players`.
    Hypixel,
    /// Every `.txt` file of an extracted dump.
    Runescape2014,
}

impl SpecialSource {
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "awesome_wordlists" => Some(SpecialSource::AwesomeWordlists),
            "japanese_names" => Some(SpecialSource::JapaneseNames),
            "hypixel" => Some(SpecialSource::Hypixel),
            "runescape_2014" => Some(SpecialSource::Runescape2014),
            _ => None,
        }
    }

    /// Extracts strict nicks, deduplicated in first-seen order.
    /// `Ok(None)` means the expected files are absent and the generic path applies.
    pub fn extract(&self, root: &Path) -> Result<Option<Vec<String>>> {
        let files = self.files(root);
        if files.is_empty() {
            debug!("{:?}: expected files missing under {}", self, root.display());
            return Ok(None);
        }

        let mut seen = HashSet::new();
        let mut nicks = Vec::new();
        for file in &files {
            let bytes = fs::read(file)?;
            let text = String::from_utf8_lossy(&bytes);
            for line in text.lines() {
                let raw = match self {
                    SpecialSource::AwesomeWordlists => match MARKDOWN_LINK.captures(line) {
                        Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
                        None => continue,
                    },
                    _ => line,
                };
                if let Some(nick) = normalize_strict(raw) {
                    if seen.insert(nick.clone()) {
                        nicks.push(nick);
                    }
                }
            }
        }
        info!("{:?}: {} nicks from {} files", self, nicks.len(), files.len());
        Ok(Some(nicks))
    }

    fn files(&self, root: &Path) -> Vec<PathBuf> {
        let existing = |names: &[&str]| -> Vec<PathBuf> {
            names
                .iter()
                .map(|n| root.join(n))
                .filter(|p| p.is_file())
                .collect()
        };
        match self {
            SpecialSource::AwesomeWordlists => existing(&["README.md"]),
            SpecialSource::JapaneseNames => {
                let files = existing(&["male.txt", "female.txt"]);
                if files.len() == 2 {
                    files
                } else {
                    existing(&["male", "female"])
                }
            }
            SpecialSource::Hypixel => existing(&["epicube-players", "hypixel-players"]),
            SpecialSource::Runescape2014 => WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_type().is_file()
                        && e.path()
                            .extension()
                            .map_or(false, |x| x.eq_ignore_ascii_case("txt"))
                })
                .map(|e| e.into_path())
                .collect(),
        }
    }
}

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::read::ZipArchive;

use crate::error::{AggregatorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detects the format from the file name.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// `names.tar.gz` -> `names`
pub fn archive_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let lower = name.to_ascii_lowercase();
    for suffix in [".tar.gz", ".tgz", ".zip"] {
        if lower.ends_with(suffix) {
            return name[..name.len() - suffix.len()].to_string();
        }
    }
    name
}

/// Prefix of the staging directories archives are unpacked into.
pub const STAGING_PREFIX: &str = ".extracting-";

/// Extracts one archive into `dest`. The archive is unpacked into a staging
/// directory beside `dest`, which only becomes `dest` once unpacking succeeded.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let format = ArchiveFormat::detect(archive).ok_or_else(|| {
        AggregatorError::Archive(format!("unsupported archive: {}", archive.display()))
    })?;
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir_in(parent)?;

    let file = File::open(archive)?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = ZipArchive::new(BufReader::new(file))?;
            zip.extract(staging.path())?;
        }
        ArchiveFormat::TarGz => {
            let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
            tar.unpack(staging.path()).map_err(|e| {
                AggregatorError::Archive(format!("{}: {}", archive.display(), e))
            })?;
        }
    }
    fs::rename(staging.path(), dest)?;
    info!("Extracted {} into {}", archive.display(), dest.display());
    Ok(())
}

/// True for staging directories left behind by an interrupted extraction.
pub fn is_staging_dir(name: &std::ffi::OsStr) -> bool {
    name.to_str().map_or(false, |n| n.starts_with(STAGING_PREFIX))
}

/// Extracts every archive found under `root` into a sibling directory named
/// after the archive stem. Archives whose target directory exists are skipped.
pub fn extract_all(root: &Path) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return match ArchiveFormat::detect(root) {
            Some(_) => {
                let dest = root
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(archive_stem(root));
                if !dest.exists() {
                    extract(root, &dest)?;
                }
                Ok(vec![dest])
            }
            None => Ok(Vec::new()),
        };
    }

    let archives: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_staging_dir(e.file_name()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && ArchiveFormat::detect(e.path()).is_some())
        .map(|e| e.into_path())
        .collect();

    let mut extracted = Vec::new();
    for archive in archives {
        let dest = archive
            .parent()
            .unwrap_or(root)
            .join(archive_stem(&archive));
        if dest.exists() {
            debug!("Archive {} already extracted", archive.display());
        } else {
            extract(&archive, &dest)?;
        }
        extracted.push(dest);
    }
    Ok(extracted)
}

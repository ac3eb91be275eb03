//! Cache and workspace cleanup.
//!
//! Removal goes through [`force_remove`], which tries a fixed list of
//! strategies in order, each with a few attempts and a growing backoff.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::Result;

const ATTEMPTS_PER_STRATEGY: u32 = 3;
const BASE_BACKOFF_MS: u64 = 50;

static TRASH_COUNTER: AtomicUsize = AtomicUsize::new(0);

type Strategy = fn(&Path) -> io::Result<()>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("remove", remove_plain),
    ("clear-readonly", clear_readonly_then_remove),
    ("rename", rename_then_remove),
    ("bottom-up", remove_bottom_up),
];

fn remove_plain(path: &Path) -> io::Result<()> {
    if path.is_dir() && !path.is_symlink() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[allow(clippy::permissions_set_readonly_false)]
fn clear_readonly_then_remove(path: &Path) -> io::Result<()> {
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            permissions.set_readonly(false);
            fs::set_permissions(entry.path(), permissions)?;
        }
    }
    remove_plain(path)
}

fn rename_then_remove(path: &Path) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let n = TRASH_COUNTER.fetch_add(1, Ordering::Relaxed);
    let trash = parent.join(format!(".trash-{}-{}", std::process::id(), n));
    fs::rename(path, &trash)?;
    remove_plain(&trash)
}

fn remove_bottom_up(path: &Path) -> io::Result<()> {
    if !path.is_dir() {
        return fs::remove_file(path);
    }
    for entry in WalkDir::new(path).contents_first(true).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Removes `path` (file, directory or symlink). Returns true once the path no
/// longer exists, including when it was never there.
pub fn force_remove(path: &Path) -> bool {
    if !exists(path) {
        return true;
    }
    for (name, strategy) in STRATEGIES {
        for attempt in 0..ATTEMPTS_PER_STRATEGY {
            match strategy(path) {
                Ok(()) if !exists(path) => {
                    debug!(path = %path.display(), strategy = name, "Removed");
                    return true;
                }
                Ok(()) => {}
                Err(e) if !exists(path) => {
                    debug!(path = %path.display(), strategy = name, "Gone after error: {}", e);
                    return true;
                }
                Err(e) => {
                    debug!(path = %path.display(), strategy = name, attempt, "Removal failed: {}", e);
                }
            }
            thread::sleep(Duration::from_millis(BASE_BACKOFF_MS << attempt));
        }
    }
    let removed = !exists(path);
    if !removed {
        warn!(path = %path.display(), "Could not remove after all strategies");
    }
    removed
}

/// Removes directories under `raw_dir` that no configured source owns.
#[instrument(skip(valid_slugs))]
pub fn clean_cache(raw_dir: &Path, valid_slugs: &[String]) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !raw_dir.exists() {
        return Ok(removed);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(raw_dir)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    entries.sort();
    for path in entries {
        if !path.is_dir() {
            continue;
        }
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if valid_slugs.iter().any(|s| *s == name) {
            continue;
        }
        if force_remove(&path) {
            info!("🗑️  Removed stale cache {}", path.display());
            removed.push(path);
        }
    }
    Ok(removed)
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Deletes every entry of `root` whose name is not in `allow_list`.
#[instrument(skip(allow_list))]
pub fn strict_clean(root: &Path, allow_list: &[&str]) -> Result<CleanReport> {
    let mut report = CleanReport::default();
    let mut entries: Vec<PathBuf> = fs::read_dir(root)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    entries.sort();
    for path in entries {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if allow_list.contains(&name.as_str()) {
            continue;
        }
        if force_remove(&path) {
            report.removed.push(path);
        } else {
            report.failed.push(path);
        }
    }
    info!("🧽 Strict cleanup: {} removed, {} failed", report.removed.len(), report.failed.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::STRICT_CLEAN_ALLOW_LIST;
    use tempfile::tempdir;

    #[test]
    fn test_force_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("tree");
        fs::create_dir_all(target.join("a/b")).unwrap();
        fs::write(target.join("a/b/file.txt"), "x").unwrap();
        assert!(force_remove(&target));
        assert!(!target.exists());
        assert!(force_remove(&target));
    }

    #[test]
    fn test_force_remove_readonly_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("locked.txt");
        fs::write(&file, "x").unwrap();
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).unwrap();
        assert!(force_remove(&file));
        assert!(!file.exists());
    }

    #[test]
    fn test_bottom_up_strategy_empties_tree() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("t");
        fs::create_dir_all(target.join("x/y")).unwrap();
        fs::write(target.join("x/y/z.txt"), "z").unwrap();
        remove_bottom_up(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_clean_cache_keeps_configured_slugs() {
        let dir = tempdir().unwrap();
        for name in ["keep", "old"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("loose.txt"), "x").unwrap();
        let removed = clean_cache(dir.path(), &["keep".to_string()]).unwrap();
        assert_eq!(removed, vec![dir.path().join("old")]);
        assert!(dir.path().join("keep").exists());
        assert!(dir.path().join("loose.txt").exists());
    }

    #[test]
    fn test_strict_clean_honors_allow_list() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("data/raw")).unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        fs::write(dir.path().join("notes.log"), "x").unwrap();

        let report = strict_clean(dir.path(), STRICT_CLEAN_ALLOW_LIST).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());
        assert!(dir.path().join("src").exists());
        assert!(dir.path().join("Cargo.toml").exists());
        assert!(!dir.path().join("data").exists());
    }
}

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::error::AggregatorError;

/// One failure, appended as a JSON line to an error log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub timestamp: String,
    pub phase: String,
    pub slug: Option<String>,
    pub kind: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl Incident {
    pub fn new(phase: &str, slug: Option<&str>, error: &AggregatorError) -> Self {
        let mut trace = Vec::new();
        let mut cause = error.source();
        while let Some(inner) = cause {
            trace.push(inner.to_string());
            cause = inner.source();
        }
        let backtrace = Backtrace::force_capture().to_string();
        trace.extend(backtrace.lines().map(|l| l.trim_end().to_string()));

        Self {
            timestamp: Utc::now().to_rfc3339(),
            phase: phase.to_string(),
            slug: slug.map(str::to_string),
            kind: error.kind().to_string(),
            message: error.to_string(),
            trace,
        }
    }
}

/// Appends an incident to `path`, creating parent directories as needed.
pub fn append(path: &Path, incident: &Incident) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(incident)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Records a failure; a failure to write the log itself is only logged.
pub fn record(path: &Path, phase: &str, slug: Option<&str>, error: &AggregatorError) {
    let incident = Incident::new(phase, slug, error);
    if let Err(e) = append(path, &incident) {
        warn!("Could not write error log {}: {}", path.display(), e);
    }
}

/// Reads back every incident in a log file, skipping malformed lines.
pub fn read_all(path: &Path) -> anyhow::Result<Vec<Incident>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_appends_json_lines() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("raw").join("src").join("download_error.log");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        record(&log, "download", Some("src"), &AggregatorError::from(io));
        record(&log, "download", Some("src"), &AggregatorError::source("src", "boom"));

        let incidents = read_all(&log).unwrap();
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].kind, "Io");
        assert_eq!(incidents[0].slug.as_deref(), Some("src"));
        assert!(incidents[0].message.contains("missing file"));
        assert!(!incidents[0].timestamp.is_empty());
        assert_eq!(incidents[1].kind, "Source");
        assert_eq!(incidents[1].phase, "download");
    }
}

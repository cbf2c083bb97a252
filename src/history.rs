use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// One finished job, appended as a single JSON line so concurrent writers
/// and partial lines cannot corrupt earlier records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_at_ms: u64,
    pub url: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl HistoryEntry {
    pub fn new(url: &str, status: &str, file: Option<PathBuf>) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            created_at_ms,
            url: url.to_string(),
            status: status.to_string(),
            file,
        }
    }
}

pub fn append(path: &Path, entry: &HistoryEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Loads the history most-recent-first. Unreadable or malformed lines are
/// dropped rather than failing the whole load.
pub fn load(path: &Path) -> Vec<HistoryEntry> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(path = %path.display(), %err, "stopped reading history");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(%err, "skipping malformed history line"),
        }
    }
    entries.reverse();
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_loads_most_recent_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.jsonl");

        append(
            &path,
            &HistoryEntry::new("https://example.com/a", "succeeded", None),
        )
        .expect("append a");
        append(
            &path,
            &HistoryEntry::new(
                "https://example.com/b",
                "failed",
                Some(PathBuf::from("/tmp/x.mp4")),
            ),
        )
        .expect("append b");

        let entries = load(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://example.com/b");
        assert_eq!(entries[0].status, "failed");
        assert_eq!(entries[0].file.as_deref(), Some(Path::new("/tmp/x.mp4")));
        assert_eq!(entries[1].url, "https://example.com/a");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load(&dir.path().join("nope.jsonl")).is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.jsonl");
        append(
            &path,
            &HistoryEntry::new("https://example.com/a", "succeeded", None),
        )
        .expect("append");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        writeln!(file, "{{not json").expect("corrupt line");
        append(
            &path,
            &HistoryEntry::new("https://example.com/b", "canceled", None),
        )
        .expect("append 2");

        let entries = load(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://example.com/b");
        assert_eq!(entries[1].url, "https://example.com/a");
    }
}

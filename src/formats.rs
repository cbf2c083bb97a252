use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cmd;
use crate::locate::FetcherHandle;

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FORMATS: usize = 20;

/// One row of the fetcher's format table, kept as loose strings since the
/// table layout varies by extractor.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FormatRow {
    pub id: String,
    pub description: String,
}

/// Asks the fetcher for the available formats of a single URL. Best-effort:
/// any spawn failure, timeout, or nonzero exit yields an empty list.
pub fn detect_formats(fetcher: &FetcherHandle, url: &str) -> Vec<FormatRow> {
    let mut command = fetcher.to_command();
    command.args(["--list-formats", "--no-download", url]);
    debug!(%url, "listing formats");

    let output = match cmd::run_with_timeout(&mut command, LIST_TIMEOUT) {
        Ok(Some(output)) if output.status.success() => output,
        Ok(Some(output)) => {
            warn!(%url, code = ?output.status.code(), "format listing failed");
            return Vec::new();
        }
        Ok(None) => {
            warn!(%url, "format listing timed out");
            return Vec::new();
        }
        Err(err) => {
            warn!(%url, %err, "could not spawn fetcher for format listing");
            return Vec::new();
        }
    };

    parse_format_table(&String::from_utf8_lossy(&output.stdout))
}

/// Extracts usable rows from `--list-formats` output. Skips extractor
/// chatter (`[youtube] ...`), separator rows without a `|`, and the header
/// row itself.
pub(crate) fn parse_format_table(stdout: &str) -> Vec<FormatRow> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('[') || !line.contains('|') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(id) = parts.next() else {
            continue;
        };
        let lowered = id.to_ascii_lowercase();
        if lowered == "format" || lowered == "code" || lowered == "id" {
            continue;
        }
        rows.push(FormatRow {
            id: id.to_string(),
            description: line.to_string(),
        });
        if rows.len() == MAX_FORMATS {
            break;
        }
    }
    rows
}

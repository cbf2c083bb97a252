use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

/// One classified line of fetcher output. Ephemeral: produced per line and
/// handed straight to the caller's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Percentage(f64),
    Phase(String),
    Destination(PathBuf),
    Log(String),
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.?\d*)%").expect("percent regex"))
}

const DOWNLOAD_DEST: &str = "[download] Destination: ";
const EXTRACT_DEST: &str = "[ExtractAudio] Destination: ";
const MERGER_DEST: &str = "[Merger] Merging formats into \"";
const ALREADY_DOWNLOADED: &str = " has already been downloaded";
const PHASE_KEYWORDS: [&str; 3] = ["downloading", "extracting", "merging"];

/// Best-effort classification of one fetcher output line. The grammar is
/// version-dependent text, so anything unrecognized degrades to `Log` and
/// classification never fails.
pub fn classify(line: &str) -> ProgressEvent {
    if line.contains('%') && line.contains("ETA") {
        if let Some(caps) = percent_re().captures(line) {
            if let Ok(percent) = caps[1].parse::<f64>() {
                return ProgressEvent::Percentage(percent);
            }
        }
    }

    if let Some((_, path)) = line.split_once(DOWNLOAD_DEST) {
        return ProgressEvent::Destination(PathBuf::from(path.trim()));
    }
    if let Some((_, path)) = line.split_once(EXTRACT_DEST) {
        return ProgressEvent::Destination(PathBuf::from(path.trim()));
    }
    if let Some((_, rest)) = line.split_once(MERGER_DEST) {
        let path = rest.trim().strip_suffix('"').unwrap_or(rest.trim());
        return ProgressEvent::Destination(PathBuf::from(path));
    }
    if line.contains(ALREADY_DOWNLOADED) {
        if let Some((_, rest)) = line.split_once("[download] ") {
            if let Some((path, _)) = rest.split_once(" has already") {
                return ProgressEvent::Destination(PathBuf::from(path.trim()));
            }
        }
    }

    let lowered = line.to_ascii_lowercase();
    if PHASE_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        let label = match line.rsplit_once(']') {
            Some((_, tail)) => tail.trim(),
            None => line.trim(),
        };
        return ProgressEvent::Phase(label.to_string());
    }

    ProgressEvent::Log(line.to_string())
}

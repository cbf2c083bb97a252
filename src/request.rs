use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::settings::DEFAULT_FILE_TEMPLATE;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Best,
    Worst,
    /// Cap the video height, e.g. `Height(720)` for "720p".
    Height(u32),
}

impl Quality {
    /// Accepts "best", "worst", "720p" or a bare height like "720".
    pub fn parse(value: &str) -> Option<Quality> {
        match value.trim().to_ascii_lowercase().as_str() {
            "best" => Some(Quality::Best),
            "worst" => Some(Quality::Worst),
            other => {
                let digits = other.strip_suffix('p').unwrap_or(other);
                digits.parse::<u32>().ok().filter(|h| *h > 0).map(Quality::Height)
            }
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Best => write!(f, "best"),
            Quality::Worst => write!(f, "worst"),
            Quality::Height(h) => write!(f, "{h}p"),
        }
    }
}

/// One download job, fixed at submission time.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub quality: Quality,
    pub audio_only: bool,
    pub playlist: bool,
    pub file_template: String,
    /// Custom yt-dlp format selector. Overrides the quality-derived selector
    /// when the media tool is available; ignored otherwise.
    pub format_override: Option<String>,
    pub cookie_file: Option<PathBuf>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub bandwidth_kbps: Option<u32>,
    pub download_archive: Option<PathBuf>,
    pub postprocess_script: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output_dir: output_dir.into(),
            quality: Quality::Best,
            audio_only: false,
            playlist: false,
            file_template: DEFAULT_FILE_TEMPLATE.to_string(),
            format_override: None,
            cookie_file: None,
            proxy: None,
            user_agent: None,
            bandwidth_kbps: None,
            download_archive: None,
            postprocess_script: None,
            plugin_dir: None,
        }
    }

    /// Rejects malformed URLs and unusable output directories before any
    /// process is spawned.
    pub fn validate(&self) -> Result<()> {
        let parsed = Url::parse(self.url.trim())
            .map_err(|e| Error::InvalidRequest(format!("malformed url {:?}: {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidRequest(format!(
                "unsupported url scheme {:?}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(Error::InvalidRequest(format!("url has no host: {:?}", self.url)));
        }

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            Error::InvalidRequest(format!(
                "output directory {} is not usable: {e}",
                self.output_dir.to_string_lossy()
            ))
        })?;
        let probe = self.output_dir.join(".viddl_write_probe");
        std::fs::write(&probe, b"").map_err(|e| {
            Error::InvalidRequest(format!(
                "output directory {} is not writable: {e}",
                self.output_dir.to_string_lossy()
            ))
        })?;
        let _ = std::fs::remove_file(&probe);

        if self.file_template.trim().is_empty() {
            return Err(Error::InvalidRequest("empty file template".to_string()));
        }
        Ok(())
    }
}

/// Shallow Netscape-format sanity check: at least one non-comment line with
/// the expected tab-separated field count. Advisory only; a failing file is
/// still forwarded, since the fetcher is the authority on the format.
pub fn cookie_file_is_valid(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let content = content.trim();
    if content.is_empty() {
        return false;
    }
    content
        .lines()
        .any(|line| !line.starts_with('#') && line.split('\t').count() >= 6)
}

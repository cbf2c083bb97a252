use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_FILE_TEMPLATE: &str = "%(uploader)s - %(id)s.%(ext)s";
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;

/// Persisted user preferences. Unknown fields are ignored so older files
/// keep loading after upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output_dir: Option<PathBuf>,
    pub file_template: String,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub bandwidth_kbps: Option<u32>,
    pub cookie_file: Option<PathBuf>,
    pub download_archive: Option<PathBuf>,
    pub postprocess_script: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    pub media_tool_path: Option<PathBuf>,
    pub max_concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: None,
            file_template: DEFAULT_FILE_TEMPLATE.to_string(),
            proxy: None,
            user_agent: None,
            bandwidth_kbps: None,
            cookie_file: None,
            download_archive: None,
            postprocess_script: None,
            plugin_dir: None,
            media_tool_path: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::Settings(format!(
                "failed to parse settings at {}: {e}",
                path.to_string_lossy()
            ))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, format!("{json}\n"))?;
        Ok(())
    }
}

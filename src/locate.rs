use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd;
use crate::paths::AppPaths;
use crate::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PIP_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const FETCHER_RELEASE_BASE: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";

/// Resolved invocation prefix for the fetcher, e.g. `yt-dlp` or
/// `python3 -m yt_dlp`. Cheap to clone; cached by callers for a session.
#[derive(Debug, Clone, Serialize)]
pub struct FetcherHandle {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl FetcherHandle {
    pub fn to_command(&self) -> Command {
        let mut cmd = cmd::command(&self.program);
        cmd.args(&self.prefix_args);
        cmd
    }
}

impl std::fmt::Display for FetcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.prefix_args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn candidates(paths: &AppPaths) -> Vec<FetcherHandle> {
    let mut list = Vec::new();
    let bundled = paths.ytdlp_bin_path();
    if bundled.exists() {
        list.push(FetcherHandle {
            program: bundled.to_string_lossy().to_string(),
            prefix_args: Vec::new(),
        });
    }
    list.push(FetcherHandle {
        program: "yt-dlp".to_string(),
        prefix_args: Vec::new(),
    });
    for launcher in ["python", "python3", "py"] {
        list.push(FetcherHandle {
            program: launcher.to_string(),
            prefix_args: vec!["-m".to_string(), "yt_dlp".to_string()],
        });
    }
    list
}

/// Read-only probe over the candidate invocation forms. Returns the first
/// that answers `--version`, along with that version string.
pub fn probe_fetcher(paths: &AppPaths) -> Option<(FetcherHandle, String)> {
    for handle in candidates(paths) {
        let mut cmd = handle.to_command();
        cmd.arg("--version");
        if let Some(version) = cmd::probe_first_line(&mut cmd, PROBE_TIMEOUT) {
            debug!(fetcher = %handle, %version, "fetcher probe ok");
            return Some((handle, version));
        }
    }
    None
}

/// Locates a working fetcher invocation, self-installing once if every
/// candidate fails. Idempotent when the tool is present: only read-only
/// probes run.
pub fn resolve_fetcher(paths: &AppPaths) -> Result<FetcherHandle> {
    if let Some((handle, _)) = probe_fetcher(paths) {
        return Ok(handle);
    }

    info!("yt-dlp not found, attempting self-install");
    let mut installed = pip_install_fetcher();
    if !installed {
        match download_fetcher_binary(paths) {
            Ok(path) => {
                info!(path = %path.to_string_lossy(), "downloaded bundled yt-dlp");
                installed = true;
            }
            Err(err) => warn!(%err, "bundled yt-dlp download failed"),
        }
    }

    if installed {
        if let Some((handle, version)) = probe_fetcher(paths) {
            info!(fetcher = %handle, %version, "fetcher installed");
            return Ok(handle);
        }
    }

    Err(Error::ToolUnavailable(
        "yt-dlp could not be located or installed automatically; install it manually \
         with `pip install yt-dlp` or place the yt-dlp binary on PATH"
            .to_string(),
    ))
}

fn pip_install_fetcher() -> bool {
    for launcher in ["python3", "python", "py"] {
        for user_flag in [true, false] {
            let mut cmd = cmd::command(launcher);
            cmd.args(["-m", "pip", "install"]);
            if user_flag {
                cmd.arg("--user");
            }
            cmd.arg("yt-dlp");
            match cmd::run_with_timeout(&mut cmd, PIP_INSTALL_TIMEOUT) {
                Ok(Some(output)) if output.status.success() => {
                    info!(%launcher, "yt-dlp installed via pip");
                    return true;
                }
                Ok(Some(output)) => {
                    debug!(
                        %launcher,
                        code = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "pip install attempt failed"
                    );
                }
                Ok(None) => warn!(%launcher, "pip install timed out"),
                Err(_) => break, // launcher missing, try the next one
            }
        }
    }
    false
}

fn fetcher_release_asset() -> &'static str {
    if cfg!(windows) {
        "yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp_linux"
    }
}

/// Downloads the standalone fetcher binary into the managed tools dir.
fn download_fetcher_binary(paths: &AppPaths) -> Result<PathBuf> {
    paths.ensure_dirs()?;

    let destination = paths.ytdlp_bin_path();
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = destination.with_extension("download");

    let url = format!("{FETCHER_RELEASE_BASE}/{}", fetcher_release_asset());
    let resp = ureq::get(&url)
        .call()
        .map_err(|e| Error::InstallFailed(format!("yt-dlp download failed: {e}")))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        return Err(Error::InstallFailed(format!(
            "yt-dlp download failed (status={status})"
        )));
    }

    {
        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
    }

    let min_size = 512 * 1024_u64;
    let downloaded_size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
    if downloaded_size < min_size {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(Error::InstallFailed(
            "downloaded yt-dlp is unexpectedly small".to_string(),
        ));
    }

    if destination.exists() {
        let _ = std::fs::remove_file(&destination);
    }
    if std::fs::rename(&tmp_path, &destination).is_err() {
        std::fs::copy(&tmp_path, &destination)?;
        let _ = std::fs::remove_file(&tmp_path);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&destination, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(destination)
}

const FETCHER_PYPI_URL: &str = "https://pypi.org/pypi/yt-dlp/json";

/// Compares the installed fetcher version against the latest PyPI release.
/// Returns the newer version string when one exists, `None` when already
/// current or when the check fails for any reason.
pub fn check_for_updates(current_version: &str) -> Option<String> {
    let body = ureq::get(FETCHER_PYPI_URL)
        .call()
        .ok()?
        .into_body()
        .read_to_string()
        .ok()?;
    let latest = latest_version_from_release_index(&body)?;
    if latest == current_version.trim() {
        None
    } else {
        debug!(current = %current_version, %latest, "fetcher update available");
        Some(latest)
    }
}

fn latest_version_from_release_index(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let version = value.get("info")?.get("version")?.as_str()?.trim();
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaToolStatus {
    pub available: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

/// Probes for the media tool: explicit override first, then the managed
/// install, then whatever is on PATH.
pub fn media_tool_status(paths: &AppPaths, override_path: Option<&Path>) -> MediaToolStatus {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = override_path {
        candidates.push(p.to_path_buf());
    }
    let managed = paths.ffmpeg_bin_path();
    if managed.exists() {
        candidates.push(managed);
    }
    candidates.push(PathBuf::from("ffmpeg"));

    for candidate in candidates {
        let mut cmd = cmd::command(&candidate);
        cmd.arg("-version");
        if let Some(version) = cmd::probe_first_line(&mut cmd, PROBE_TIMEOUT) {
            return MediaToolStatus {
                available: true,
                path: Some(candidate),
                version: Some(version),
            };
        }
    }
    MediaToolStatus {
        available: false,
        path: None,
        version: None,
    }
}

pub fn install_media_tool(paths: &AppPaths) -> Result<MediaToolStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    std::fs::create_dir_all(&destination)?;

    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| Error::InstallFailed(e.to_string()))?;
    let archive_path =
        ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
            .map_err(|e| Error::InstallFailed(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| Error::InstallFailed(e.to_string()))?;

    Ok(media_tool_status(paths, None))
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolState {
    Present { version: String },
    Absent,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub fetcher: ToolState,
    pub media_tool: ToolState,
}

pub fn check_dependencies(paths: &AppPaths, media_tool_override: Option<&Path>) -> DependencyReport {
    let fetcher = match probe_fetcher(paths) {
        Some((_, version)) => ToolState::Present { version },
        None => ToolState::Absent,
    };

    let media = media_tool_status(paths, media_tool_override);
    let media_tool = match media.version {
        Some(version) if media.available => ToolState::Present { version },
        _ => ToolState::Absent,
    };

    DependencyReport { fetcher, media_tool }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_order_prefers_bundled_binary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let plain = candidates(&paths);
        assert_eq!(plain[0].program, "yt-dlp");
        assert!(plain
            .iter()
            .any(|c| c.program == "python3" && c.prefix_args == ["-m", "yt_dlp"]));

        let bundled = paths.ytdlp_bin_path();
        std::fs::create_dir_all(bundled.parent().expect("parent")).expect("dirs");
        std::fs::write(&bundled, b"#!/bin/sh\n").expect("write");
        let with_bundled = candidates(&paths);
        assert_eq!(with_bundled[0].program, bundled.to_string_lossy());
        assert_eq!(with_bundled.len(), plain.len() + 1);
    }

    #[test]
    fn fetcher_handle_displays_prefix_args() {
        let handle = FetcherHandle {
            program: "python3".to_string(),
            prefix_args: vec!["-m".to_string(), "yt_dlp".to_string()],
        };
        assert_eq!(handle.to_string(), "python3 -m yt_dlp");
    }

    #[cfg(unix)]
    #[test]
    fn probe_fetcher_uses_bundled_stub() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let bundled = paths.ytdlp_bin_path();
        std::fs::create_dir_all(bundled.parent().expect("parent")).expect("dirs");
        std::fs::write(&bundled, "#!/bin/sh\necho 2025.08.01\n").expect("write");
        std::fs::set_permissions(&bundled, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let (handle, version) = probe_fetcher(&paths).expect("probe");
        assert_eq!(handle.program, bundled.to_string_lossy());
        assert_eq!(version, "2025.08.01");
    }

    #[cfg(unix)]
    #[test]
    fn resolve_fetcher_twice_is_read_only_when_present() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let bundled = paths.ytdlp_bin_path();
        std::fs::create_dir_all(bundled.parent().expect("parent")).expect("dirs");
        std::fs::write(&bundled, "#!/bin/sh\necho 2025.08.01\n").expect("write");
        std::fs::set_permissions(&bundled, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let snapshot = |dir: &Path| -> Vec<String> {
            let mut names: Vec<String> = walk_files(dir)
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect();
            names.sort();
            names
        };
        let before = snapshot(dir.path());

        let first = resolve_fetcher(&paths).expect("first resolve");
        let second = resolve_fetcher(&paths).expect("second resolve");

        assert_eq!(first.program, bundled.to_string_lossy());
        assert_eq!(second.program, first.program);
        assert_eq!(second.prefix_args, first.prefix_args);
        // Present tool means probes only: no files appear or vanish.
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn release_index_version_extraction() {
        let body = r#"{"info":{"version":"2025.08.20","name":"yt-dlp"},"releases":{}}"#;
        assert_eq!(
            latest_version_from_release_index(body),
            Some("2025.08.20".to_string())
        );
        assert_eq!(latest_version_from_release_index("{}"), None);
        assert_eq!(latest_version_from_release_index("not json"), None);
        assert_eq!(
            latest_version_from_release_index(r#"{"info":{"version":""}}"#),
            None
        );
    }

    fn walk_files(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut files = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return files;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk_files(&path));
            } else {
                files.push(path);
            }
        }
        files
    }
}

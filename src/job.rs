use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::args;
use crate::cmd;
use crate::locate::FetcherHandle;
use crate::process::{LineRead, Supervisor, TerminationStatus};
use crate::progress::{classify, ProgressEvent};
use crate::request::DownloadRequest;

const HOOK_TIMEOUT: Duration = Duration::from_secs(600);

/// Receives progress while a job (or batch) runs. Events are tagged with the
/// originating URL so batch consumers can demultiplex.
pub trait ProgressSink: Sync {
    fn event(&self, url: &str, event: &ProgressEvent);

    /// Aggregate completion accounting, called after each job in a batch
    /// reaches a terminal state.
    fn batch_progress(&self, _completed: usize, _total: usize) {}
}

/// Sink that discards everything. Useful for callers that only want the
/// returned outcome.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _url: &str, _event: &ProgressEvent) {}
}

/// Cooperative cancellation token, observed at line-read boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

/// Terminal result of one job. The log always carries every captured output
/// line so failures can be diagnosed without re-running.
#[derive(Debug)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub output_path: Option<PathBuf>,
    pub log: Vec<String>,
}

impl JobOutcome {
    fn failed(log: Vec<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            output_path: None,
            log,
        }
    }
}

/// Runs one download end-to-end: validate, build the argument vector,
/// supervise the fetcher, classify its output, settle the terminal status,
/// and fire post-success hooks. Blocking; the batch scheduler gives each
/// call its own worker thread.
pub fn run_job(
    req: &DownloadRequest,
    fetcher: &FetcherHandle,
    media_tool: Option<&Path>,
    sink: &dyn ProgressSink,
    cancel: &CancelFlag,
) -> JobOutcome {
    let mut log = Vec::new();

    if let Err(err) = req.validate() {
        let line = err.to_string();
        sink.event(&req.url, &ProgressEvent::Log(line.clone()));
        log.push(line);
        return JobOutcome::failed(log);
    }

    let argv = args::build_args(req, media_tool);
    let command_line = format!("fetcher command: {fetcher} {}", argv.join(" "));
    sink.event(&req.url, &ProgressEvent::Log(command_line.clone()));
    log.push(command_line);

    let mut supervisor = match Supervisor::spawn(fetcher, &argv) {
        Ok(s) => s,
        Err(err) => {
            let line = format!("failed to launch fetcher: {err}");
            sink.event(&req.url, &ProgressEvent::Log(line.clone()));
            log.push(line);
            return JobOutcome::failed(log);
        }
    };

    let mut last_file: Option<PathBuf> = None;
    loop {
        if cancel.is_requested() {
            supervisor.terminate();
        }
        match supervisor.next_line() {
            LineRead::Line(line) => {
                let event = classify(&line);
                if let ProgressEvent::Destination(path) = &event {
                    // Later destinations supersede earlier ones: a merge or
                    // audio-extraction target replaces the raw download file.
                    last_file = Some(path.clone());
                }
                sink.event(&req.url, &event);
                log.push(line);
            }
            LineRead::Idle => {}
            LineRead::Eof => break,
        }
    }

    match supervisor.finish() {
        TerminationStatus::Killed => {
            info!(url = %req.url, "job canceled");
            return JobOutcome {
                status: JobStatus::Canceled,
                output_path: last_file,
                log,
            };
        }
        TerminationStatus::Error(code) => {
            log.push(format!("fetcher exited with code {code:?}"));
            return JobOutcome {
                status: JobStatus::Failed,
                output_path: last_file,
                log,
            };
        }
        TerminationStatus::Ok => {}
    }

    // Exit code zero is not user-visible success unless the artifact can be
    // located on disk.
    let resolved = match resolve_output_path(last_file.as_deref(), &req.output_dir) {
        Some(path) => path,
        None => {
            let line = "fetcher reported success but no output file could be located".to_string();
            warn!(url = %req.url, "{line}");
            sink.event(&req.url, &ProgressEvent::Log(line.clone()));
            log.push(line);
            return JobOutcome {
                status: JobStatus::Failed,
                output_path: None,
                log,
            };
        }
    };

    run_success_hooks(req, &resolved, &mut log);

    info!(url = %req.url, path = %resolved.to_string_lossy(), "job succeeded");
    JobOutcome {
        status: JobStatus::Succeeded,
        output_path: Some(resolved),
        log,
    }
}

/// Returns the reported path when it exists, otherwise falls back to a
/// best-effort directory scan: the fetcher sometimes renames files during
/// merge or extraction after the last Destination line was printed.
fn resolve_output_path(reported: Option<&Path>, output_dir: &Path) -> Option<PathBuf> {
    let reported = reported?;
    if reported.exists() {
        return Some(reported.to_path_buf());
    }
    debug!(
        reported = %reported.to_string_lossy(),
        "reported output path missing, scanning output directory"
    );
    reconcile_renamed_output(reported, output_dir)
}

/// Matches by the item-id token (between the last " - " and the extension of
/// the expected filename) plus the expected extension. Most recently
/// modified candidate wins, which keeps an unrelated stale file from
/// shadowing the fresh download.
fn reconcile_renamed_output(expected: &Path, output_dir: &Path) -> Option<PathBuf> {
    let expected_name = expected.file_name()?.to_string_lossy().to_string();

    let id = expected_name
        .rsplit_once(" - ")
        .map(|(_, tail)| tail)
        .and_then(|tail| tail.split('.').next())
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    let ext = expected_name.rsplit_once('.').map(|(_, e)| e)?;

    let mut best: Option<(PathBuf, SystemTime)> = None;
    for entry in std::fs::read_dir(output_dir).ok()?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(id) || !name.ends_with(ext) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        match &best {
            Some((_, best_time)) if *best_time >= modified => {}
            _ => best = Some((path, modified)),
        }
    }
    best.map(|(path, _)| path)
}

/// Post-process script and plugin scripts run after a confirmed success.
/// Their failures are logged, never escalated: the download itself is done.
fn run_success_hooks(req: &DownloadRequest, file: &Path, log: &mut Vec<String>) {
    if let Some(script) = &req.postprocess_script {
        if script.exists() {
            run_hook(script, file, log);
        }
    }
    if let Some(plugin_dir) = &req.plugin_dir {
        let entries = match std::fs::read_dir(plugin_dir) {
            Ok(entries) => entries,
            Err(err) => {
                log.push(format!(
                    "plugin directory {} unreadable: {err}",
                    plugin_dir.to_string_lossy()
                ));
                return;
            }
        };
        let mut scripts: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        scripts.sort();
        for script in scripts {
            run_hook(&script, file, log);
        }
    }
}

fn run_hook(script: &Path, file: &Path, log: &mut Vec<String>) {
    let mut command = cmd::command(script);
    command.arg(file);
    match cmd::run_with_timeout(&mut command, HOOK_TIMEOUT) {
        Ok(Some(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stdout = stdout.trim();
            if !stdout.is_empty() {
                log.push(format!("hook {} output: {stdout}", script.to_string_lossy()));
            }
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                log.push(format!(
                    "hook {} failed (code={:?}): {}",
                    script.to_string_lossy(),
                    output.status.code(),
                    stderr.trim()
                ));
            }
        }
        Ok(None) => {
            log.push(format!("hook {} timed out", script.to_string_lossy()));
        }
        Err(err) => {
            log.push(format!("hook {} error: {err}", script.to_string_lossy()));
        }
    }
}

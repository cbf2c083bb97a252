use std::io::{BufRead, BufReader};
use std::path::PathBuf;
#[cfg(unix)]
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use viddl::job::{CancelFlag, JobStatus, ProgressSink};
use viddl::paths::AppPaths;
use viddl::progress::ProgressEvent;
use viddl::request::{DownloadRequest, Quality};
use viddl::settings::Settings;
use viddl::{batch, formats, history, locate};

/// Command-line front end for the download engine.
#[derive(Debug, Parser)]
#[command(name = "viddl")]
#[command(about = "viddl: yt-dlp based video download orchestrator", long_about = None)]
struct Cli {
    /// Video or playlist URL to download.
    url: Option<String>,

    /// File with one URL per line; blank lines and #-comments are skipped.
    #[arg(long, conflicts_with = "url")]
    batch_file: Option<PathBuf>,

    /// Output directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Quality: best, worst, or a height such as 720p.
    #[arg(short, long)]
    quality: Option<String>,

    /// Extract audio as mp3 instead of downloading video.
    #[arg(short, long)]
    audio: bool,

    /// Download the whole playlist when the URL points at one.
    #[arg(short, long)]
    playlist: bool,

    /// Netscape-format cookie file handed to the fetcher.
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// Custom fetcher format selector; overrides --quality.
    #[arg(short, long)]
    format: Option<String>,

    /// List available formats for the URL and exit.
    #[arg(long)]
    list_formats: bool,

    /// Maximum concurrent downloads (capped at 8).
    #[arg(long)]
    parallel: Option<usize>,

    /// Settings file to load instead of the default location.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip URLs recorded in the download archive.
    #[arg(long)]
    skip_downloaded: bool,

    /// Probe for the fetcher and media tool, print a report, and exit.
    #[arg(long)]
    check_deps: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the application base directory.
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn,viddl=info",
        1 => "info,viddl=debug",
        _ => "debug,viddl=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("viddl error: {err:#}");
            std::process::exit(1);
        }
    }
}

struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn event(&self, url: &str, event: &ProgressEvent) {
        match event {
            ProgressEvent::Percentage(pct) => eprint!("\r{url}: {pct:.1}%    "),
            ProgressEvent::Phase(phase) => eprintln!("\n{url}: {phase}"),
            ProgressEvent::Destination(path) => eprintln!("\n{url}: -> {}", path.display()),
            ProgressEvent::Log(_) => {}
        }
    }

    fn batch_progress(&self, completed: usize, total: usize) {
        eprintln!("\n[{completed}/{total}] finished");
    }
}

fn run(cli: Cli) -> Result<i32> {
    let base_dir = cli
        .base_dir
        .clone()
        .unwrap_or_else(AppPaths::default_base_dir);
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().context("creating application dirs")?;

    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths.settings_path());
    let settings = Settings::load(&settings_path).context("loading settings")?;

    if cli.check_deps {
        let report = locate::check_dependencies(&paths, settings.media_tool_path.as_deref());
        println!("{}", serde_json::to_string_pretty(&report)?);
        if let locate::ToolState::Present { version } = &report.fetcher {
            if let Some(latest) = locate::check_for_updates(version) {
                println!("yt-dlp update available: {latest} (installed: {version})");
            }
        }
        return Ok(0);
    }

    let urls = collect_urls(&cli)?;
    if urls.is_empty() {
        bail!("no URL given; pass one as an argument or use --batch-file");
    }

    let fetcher = locate::resolve_fetcher(&paths).context("locating the fetcher")?;
    let media_tool = locate::media_tool_status(&paths, settings.media_tool_path.as_deref());
    if !media_tool.available {
        tracing::warn!("media tool not found; merged formats and mp3 extraction are degraded");
    }

    if cli.list_formats {
        for url in &urls {
            let rows = formats::detect_formats(&fetcher, url);
            if rows.is_empty() {
                println!("{url}: no formats reported");
                continue;
            }
            println!("{url}:");
            for row in rows {
                println!("  {}", row.description);
            }
        }
        return Ok(0);
    }

    let requests: Vec<DownloadRequest> = urls
        .iter()
        .map(|url| build_request(url, &cli, &settings, &paths))
        .collect::<Result<_>>()?;

    let cancel = CancelFlag::new();
    spawn_interrupt_watcher(cancel.clone());

    let parallel = cli.parallel.unwrap_or(settings.max_concurrency);
    let report = batch::run_batch(
        requests,
        parallel,
        &fetcher,
        media_tool.path.as_deref(),
        &ConsoleSink,
        &cancel,
    );

    let history_path = paths.history_path();
    let mut failed = 0usize;
    for (url, outcome) in report.entries() {
        let entry = history::HistoryEntry::new(url, outcome.status.as_str(), outcome.output_path.clone());
        if let Err(err) = history::append(&history_path, &entry) {
            tracing::warn!(%err, "could not record history");
        }
        match outcome.status {
            JobStatus::Succeeded => {
                let shown = outcome
                    .output_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                println!("ok      {url} {shown}");
            }
            JobStatus::Failed => {
                failed += 1;
                println!("failed  {url}");
                if let Some(line) = outcome.log.iter().rev().find(|l| !l.trim().is_empty()) {
                    println!("        {line}");
                }
            }
            JobStatus::Canceled => {
                failed += 1;
                println!("canceled {url}");
            }
        }
    }

    Ok(if failed == 0 { 0 } else { 1 })
}

fn collect_urls(cli: &Cli) -> Result<Vec<String>> {
    if let Some(url) = &cli.url {
        return Ok(vec![url.clone()]);
    }
    let Some(path) = &cli.batch_file else {
        return Ok(Vec::new());
    };
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening batch file {}", path.display()))?;
    let mut urls = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        urls.push(line.to_string());
    }
    Ok(urls)
}

fn build_request(
    url: &str,
    cli: &Cli,
    settings: &Settings,
    paths: &AppPaths,
) -> Result<DownloadRequest> {
    let output_dir = cli
        .output
        .clone()
        .or_else(|| settings.output_dir.clone())
        .unwrap_or_else(|| paths.default_download_dir());

    let mut req = DownloadRequest::new(url, output_dir);
    req.file_template = settings.file_template.clone();
    if let Some(quality) = &cli.quality {
        req.quality = Quality::parse(quality)
            .with_context(|| format!("unrecognized quality {quality:?}"))?;
    }
    req.audio_only = cli.audio;
    req.playlist = cli.playlist;
    req.format_override = cli.format.clone();
    req.cookie_file = cli.cookies.clone().or_else(|| settings.cookie_file.clone());
    if let Some(cookie_file) = &req.cookie_file {
        if !viddl::request::cookie_file_is_valid(cookie_file) {
            tracing::warn!(
                path = %cookie_file.display(),
                "cookie file does not look like Netscape format"
            );
        }
    }
    req.proxy = settings.proxy.clone();
    req.user_agent = settings.user_agent.clone();
    req.bandwidth_kbps = settings.bandwidth_kbps;
    if cli.skip_downloaded {
        req.download_archive = Some(
            settings
                .download_archive
                .clone()
                .unwrap_or_else(|| paths.download_archive_path()),
        );
        if let Some(archive) = &req.download_archive {
            if let Some(parent) = archive.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !archive.exists() {
                std::fs::write(archive, b"")?;
            }
        }
    }
    req.postprocess_script = settings.postprocess_script.clone();
    req.plugin_dir = settings.plugin_dir.clone();
    Ok(req)
}

#[cfg(unix)]
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// First Ctrl-C flips the shared cancel flag; running jobs stop at their
/// next line-read boundary and queued jobs never start.
#[cfg(unix)]
fn spawn_interrupt_watcher(cancel: CancelFlag) {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            tracing::info!("interrupt received; canceling remaining jobs");
            cancel.request();
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    });
}

#[cfg(not(unix))]
fn spawn_interrupt_watcher(_cancel: CancelFlag) {}

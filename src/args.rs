use std::path::Path;

use crate::request::{DownloadRequest, Quality};

/// Builds the yt-dlp argument vector for one request. Pure apart from
/// existence checks on optional file paths, which are silently dropped
/// when missing rather than treated as errors.
pub fn build_args(req: &DownloadRequest, media_tool: Option<&Path>) -> Vec<String> {
    let template_path = req.output_dir.join(&req.file_template);
    let template_path = std::path::absolute(&template_path).unwrap_or(template_path);

    let mut args = vec![
        req.url.clone(),
        "-o".to_string(),
        template_path.to_string_lossy().to_string(),
        "--ignore-errors".to_string(),
        "--retries".to_string(),
        "3".to_string(),
        "--newline".to_string(),
    ];

    if let Some(ffmpeg) = media_tool {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().to_string());
    }
    if let Some(proxy) = &req.proxy {
        args.push("--proxy".to_string());
        args.push(proxy.clone());
    }
    if let Some(ua) = &req.user_agent {
        args.push("--user-agent".to_string());
        args.push(ua.clone());
    }
    if let Some(kbps) = req.bandwidth_kbps {
        args.push("--limit-rate".to_string());
        args.push(format!("{kbps}K"));
    }
    if !req.playlist {
        args.push("--no-playlist".to_string());
    }

    if req.audio_only {
        // Audio extraction ignores the quality/format selectors entirely.
        args.extend(
            ["--extract-audio", "--audio-format", "mp3", "--audio-quality", "192K"]
                .map(str::to_string),
        );
    } else {
        args.push("-f".to_string());
        args.push(format_selector(req, media_tool.is_some()));
    }

    if let Some(cookie_file) = &req.cookie_file {
        if cookie_file.exists() {
            args.push("--cookies".to_string());
            args.push(cookie_file.to_string_lossy().to_string());
        }
    }
    if let Some(archive) = &req.download_archive {
        if archive.exists() {
            args.push("--download-archive".to_string());
            args.push(archive.to_string_lossy().to_string());
        }
    }

    args
}

fn format_selector(req: &DownloadRequest, media_tool_available: bool) -> String {
    if media_tool_available {
        if let Some(custom) = &req.format_override {
            return custom.clone();
        }
        match req.quality {
            Quality::Best => "best".to_string(),
            Quality::Worst => "worst".to_string(),
            Quality::Height(h) => {
                format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]")
            }
        }
    } else {
        // Without the media tool nothing can mux separate streams, so only
        // single-file (audio+video combined) selectors are allowed. A custom
        // selector is ignored here for the same reason.
        match req.quality {
            Quality::Best => "best[acodec!=none][vcodec!=none]/best".to_string(),
            Quality::Worst => "worst[acodec!=none][vcodec!=none]/worst".to_string(),
            Quality::Height(h) => format!(
                "best[height<={h}][acodec!=none][vcodec!=none]/best[height<={h}]"
            ),
        }
    }
}

//! Episode concatenation with FFmpeg
//!
//! Uses FFmpeg's concat demuxer with stream copy, so merging is fast and
//! lossless as long as every episode shares the same codecs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::core::error::{Error, Result};

/// File name of the concat list written next to the merge output
pub const CONCAT_LIST_NAME: &str = "concat_list.txt";

/// Merge progress callback, from 0.0 to 1.0
pub type MergeProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Upper bound for one ffprobe duration query
const DURATION_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Install locations checked when ffmpeg is not on `PATH`
const COMMON_FFMPEG_PATHS: &[&str] = &[
    "/usr/local/bin/ffmpeg",
    "/usr/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
    "C:\\ffmpeg\\bin\\ffmpeg.exe",
    "C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe",
];

/// Concatenates finished episodes into one file
#[async_trait]
pub trait MergeService: Send + Sync {
    /// Whether the external tool can be used at all
    fn available(&self) -> bool;

    /// Concatenate `inputs`, in the given order, into `destination`
    async fn merge(&self, inputs: &[PathBuf], destination: &Path) -> Result<()>;

    /// Like [`merge`](MergeService::merge), reporting how far it got
    async fn merge_with_progress(
        &self,
        inputs: &[PathBuf],
        destination: &Path,
        progress: Option<MergeProgressCallback>,
    ) -> Result<()> {
        self.merge(inputs, destination).await?;
        if let Some(progress) = progress {
            progress(1.0);
        }
        Ok(())
    }
}

/// [`MergeService`] backed by the `ffmpeg` executable
#[derive(Debug, Clone)]
pub struct FfmpegMerger {
    ffmpeg: Option<PathBuf>,
}

impl Default for FfmpegMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegMerger {
    /// Locate ffmpeg on `PATH` or in a common install location
    pub fn new() -> Self {
        let ffmpeg = which::which("ffmpeg").ok().or_else(|| {
            COMMON_FFMPEG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists())
        });
        debug!("FFmpeg executable: {ffmpeg:?}");
        Self { ffmpeg }
    }

    /// Use a specific executable (or none)
    pub fn with_executable(ffmpeg: Option<PathBuf>) -> Self {
        Self { ffmpeg }
    }

    pub fn executable(&self) -> Option<&Path> {
        self.ffmpeg.as_deref()
    }

    /// `ffprobe` installed next to the located ffmpeg
    pub fn ffprobe(&self) -> Option<PathBuf> {
        let ffmpeg = self.ffmpeg.as_deref()?;
        let name = ffmpeg.file_name()?.to_str()?.replace("ffmpeg", "ffprobe");
        let ffprobe = ffmpeg.with_file_name(name);
        ffprobe.exists().then_some(ffprobe)
    }

    /// Duration of a video in seconds, 0.0 when it cannot be determined
    pub async fn video_duration(&self, video: &Path) -> f64 {
        let Some(ffprobe) = self.ffprobe() else {
            return 0.0;
        };
        let query = Command::new(&ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(video)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        match tokio::time::timeout(DURATION_QUERY_TIMEOUT, query).await {
            Ok(Ok(output)) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse()
                .unwrap_or(0.0),
            Ok(Ok(output)) => {
                debug!("ffprobe exited with {} for {}", output.status, video.display());
                0.0
            }
            Ok(Err(e)) => {
                debug!("ffprobe failed for {}: {e}", video.display());
                0.0
            }
            Err(_) => {
                debug!("ffprobe timed out for {}", video.display());
                0.0
            }
        }
    }

    /// Check inputs and return ffmpeg plus the concat list location
    async fn prepare(&self, inputs: &[PathBuf], destination: &Path) -> Result<(PathBuf, PathBuf)> {
        let ffmpeg = self.ffmpeg.clone().ok_or_else(|| {
            Error::MergeFailed(
                "FFmpeg not found. Install it (brew install ffmpeg / apt install ffmpeg) to merge episodes"
                    .to_string(),
            )
        })?;

        if inputs.is_empty() {
            return Err(Error::MergeFailed("No video files to merge".to_string()));
        }
        for input in inputs {
            if !input.exists() {
                return Err(Error::MergeFailed(format!(
                    "File not found: {}",
                    input.display()
                )));
            }
        }

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        Ok((ffmpeg, parent.join(CONCAT_LIST_NAME)))
    }

    async fn remove_concat_list(list_path: &Path) {
        if let Err(e) = tokio::fs::remove_file(list_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove {}: {e}", list_path.display());
            }
        }
    }

    async fn write_concat_list(inputs: &[PathBuf], list_path: &Path) -> Result<()> {
        let mut contents = String::new();
        for input in inputs {
            let absolute = tokio::fs::canonicalize(input).await?;
            contents.push_str(&concat_entry(&absolute));
            contents.push('\n');
        }

        let mut file = tokio::fs::File::create(list_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn run_concat(
        &self,
        ffmpeg: &Path,
        inputs: &[PathBuf],
        list_path: &Path,
        destination: &Path,
    ) -> Result<()> {
        Self::write_concat_list(inputs, list_path).await?;

        info!("Merging {} videos into {}", inputs.len(), destination.display());
        let output = Command::new(ffmpeg)
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(list_path)
            .arg("-c")
            .arg("copy")
            .arg("-y")
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::MergeFailed(format!(
                "FFmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        check_output(destination).await
    }

    /// Run the concat with `-progress pipe:1`, turning `out_time_ms=` lines
    /// into fractions of `total_seconds`
    async fn run_concat_with_progress(
        &self,
        ffmpeg: &Path,
        inputs: &[PathBuf],
        list_path: &Path,
        destination: &Path,
        total_seconds: f64,
        progress: &MergeProgressCallback,
    ) -> Result<()> {
        Self::write_concat_list(inputs, list_path).await?;

        info!(
            "Merging {} videos ({total_seconds:.0}s) into {}",
            inputs.len(),
            destination.display()
        );
        let mut child = Command::new(ffmpeg)
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(list_path)
            .arg("-c")
            .arg("copy")
            .arg("-progress")
            .arg("pipe:1")
            .arg("-y")
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain stderr alongside stdout so neither pipe fills up
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(fraction) = parse_progress_line(&line, total_seconds) {
                    progress(fraction);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(Error::MergeFailed(format!(
                "FFmpeg exited with {status}: {}",
                stderr.trim()
            )));
        }
        check_output(destination).await
    }
}

/// Fraction of `total_seconds` reached by an `out_time_ms=` progress line
///
/// FFmpeg reports `out_time_ms` in microseconds despite the name.
fn parse_progress_line(line: &str, total_seconds: f64) -> Option<f64> {
    let micros: i64 = line.trim().strip_prefix("out_time_ms=")?.parse().ok()?;
    if total_seconds <= 0.0 {
        return None;
    }
    let seconds = micros.max(0) as f64 / 1_000_000.0;
    Some((seconds / total_seconds).min(1.0))
}

async fn check_output(destination: &Path) -> Result<()> {
    let written = tokio::fs::metadata(destination)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);
    if written == 0 {
        return Err(Error::MergeFailed("Output file not created".to_string()));
    }
    Ok(())
}

#[async_trait]
impl MergeService for FfmpegMerger {
    fn available(&self) -> bool {
        self.ffmpeg.is_some()
    }

    async fn merge(&self, inputs: &[PathBuf], destination: &Path) -> Result<()> {
        let (ffmpeg, list_path) = self.prepare(inputs, destination).await?;
        let result = self.run_concat(&ffmpeg, inputs, &list_path, destination).await;
        Self::remove_concat_list(&list_path).await;
        result
    }

    async fn merge_with_progress(
        &self,
        inputs: &[PathBuf],
        destination: &Path,
        progress: Option<MergeProgressCallback>,
    ) -> Result<()> {
        let Some(progress) = progress else {
            return self.merge(inputs, destination).await;
        };
        let (ffmpeg, list_path) = self.prepare(inputs, destination).await?;

        let mut total_seconds = 0.0;
        for input in inputs {
            total_seconds += self.video_duration(input).await;
        }
        if total_seconds <= 0.0 {
            warn!("Video durations unknown, merging without progress");
            let result = self.run_concat(&ffmpeg, inputs, &list_path, destination).await;
            Self::remove_concat_list(&list_path).await;
            return result;
        }

        let result = self
            .run_concat_with_progress(&ffmpeg, inputs, &list_path, destination, total_seconds, &progress)
            .await;
        Self::remove_concat_list(&list_path).await;
        if result.is_ok() {
            progress(1.0);
        }
        result
    }
}

/// One `file '...'` line of an FFmpeg concat list
fn concat_entry(path: &Path) -> String {
    let raw = path.display().to_string();
    let escaped = if cfg!(windows) {
        raw.replace('\\', "/").replace('\'', "\\'")
    } else {
        raw.replace('\'', "'\\''")
    };
    format!("file '{escaped}'")
}

static INVALID_FILENAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());
static WHITESPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Make a series title usable as a file name
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = INVALID_FILENAME_CHARS.replace_all(name, "");
    let collapsed = WHITESPACE_RUNS.replace_all(&cleaned, " ");
    collapsed.trim().chars().take(100).collect()
}

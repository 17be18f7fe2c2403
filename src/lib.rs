//! # Rongyok-dl Library
//!
//! Resumable downloads of episodic video series, one episode at a time, with
//! progress that survives crashes and restarts.
//!
//! ## Features
//!
//! - **Resumable transfers**: partial files continue with HTTP range requests
//! - **Crash-safe state**: a JSON snapshot in the output directory records
//!   which episodes are done and how far the current one got
//! - **Cooperative control**: pause, resume and cancel from any task
//! - **Merging**: optional FFmpeg concatenation of the finished episodes
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let summary = rongyok_dl::download(
//!         "https://rongyok.com/watch/?series_id=941",
//!         "1-5,10",
//!         "./output",
//!     )
//!     .await?;
//!     println!("{} downloaded, {} failed", summary.succeeded, summary.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Driving a Session
//!
//! ```rust,no_run
//! use rongyok_dl::{ControlPlane, Downloader, EpisodeResolver, RongyokResolver, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolver = RongyokResolver::new()?;
//!     let series = resolver.series_info(941).await?;
//!
//!     let mut session = Session::new(resolver, Downloader::new("./output")?);
//!     session.start(&series, [1, 2, 3].into_iter().collect()).await?;
//!
//!     let control = ControlPlane::new();
//!     let summary = session.run(941, &[1, 2, 3], &control, None).await;
//!     println!("{summary:?}");
//!     Ok(())
//! }
//! ```

pub use crate::core::control::ControlPlane;
pub use crate::core::downloader::{episode_file_name, Downloader, TransferOutcome, PARTIAL_SUFFIX};
pub use crate::core::error::{Error, Result};
pub use crate::core::merger::{
    sanitize_filename, FfmpegMerger, MergeProgressCallback, MergeService,
};
pub use crate::core::selection::parse_episode_selection;
pub use crate::core::session::{
    find_episode_files, merge_existing, BatchSummary, Session, SessionEvent,
};
pub use crate::core::source::{
    parse_series_url, EpisodeDescriptor, EpisodeResolver, RongyokResolver, SeriesInfo,
    SourceConfig,
};
pub use crate::core::state::{DownloadProgress, SessionState, StateStore, STATE_FILE_NAME};
pub use crate::core::stream::{ProgressCallback, TransferOptions};

// Internal modules
mod core;

/// Look up a series from its watch page URL
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let series = rongyok_dl::series_info("https://rongyok.com/watch/?series_id=941").await?;
/// println!("{} ({} episodes)", series.title, series.total_episodes);
/// # Ok(())
/// # }
/// ```
pub async fn series_info(url: &str) -> Result<SeriesInfo> {
    let series_id = parse_series_url(url)
        .ok_or_else(|| Error::InvalidInput(format!("Could not find a series id in {url}")))?;
    RongyokResolver::new()?.series_info(series_id).await
}

/// Download the episodes named by `selection` into `output_dir`
///
/// Starts a fresh session; episodes already on disk as partial files are
/// still resumed from where they stopped.
pub async fn download(url: &str, selection: &str, output_dir: &str) -> Result<BatchSummary> {
    let series_id = parse_series_url(url)
        .ok_or_else(|| Error::InvalidInput(format!("Could not find a series id in {url}")))?;
    let resolver = RongyokResolver::new()?;
    let series = resolver.series_info(series_id).await?;

    let selected = parse_episode_selection(selection, series.total_episodes);
    if selected.is_empty() {
        return Err(Error::InvalidInput(format!(
            "No valid episodes in selection '{selection}'"
        )));
    }
    let episodes: Vec<u32> = selected.iter().copied().collect();

    let mut session = Session::new(resolver, Downloader::new(output_dir)?);
    session.start(&series, selected).await?;
    Ok(session.run(series_id, &episodes, &ControlPlane::new(), None).await)
}

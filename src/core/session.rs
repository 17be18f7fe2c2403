//! Session driver
//!
//! Runs a batch of episodes strictly one after another: resolve the URL,
//! transfer it, report what happened. Progress and results leave the driver
//! as [`SessionEvent`]s on a channel, so a UI never touches the transfer's
//! state directly.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::control::ControlPlane;
use crate::core::downloader::{Downloader, TransferOutcome};
use crate::core::error::{Error, Result};
use crate::core::merger::{sanitize_filename, MergeProgressCallback, MergeService};
use crate::core::source::{EpisodeResolver, SeriesInfo};
use crate::core::state::SessionState;
use crate::core::stream::{ProgressCallback, TransferOptions};

/// Something that happened while running a batch
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An episode is about to be resolved and transferred
    EpisodeStarted {
        episode: u32,
        position: usize,
        count: usize,
    },
    /// Already completed in this session, nothing to do
    EpisodeSkipped { episode: u32 },
    /// Bytes arrived for the active episode
    Progress {
        episode: u32,
        downloaded: u64,
        total: u64,
        bytes_per_sec: f64,
    },
    EpisodeCompleted { episode: u32, bytes: u64 },
    EpisodeFailed { episode: u32, reason: String },
    EpisodeCancelled { episode: u32, downloaded: u64 },
}

/// Counts for a finished batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// The batch stopped early because of a cancel signal
    pub cancelled: bool,
}

/// Drives one series download in one output directory
pub struct Session<R> {
    resolver: R,
    downloader: Downloader,
    options: TransferOptions,
}

impl<R: EpisodeResolver> Session<R> {
    pub fn new(resolver: R, downloader: Downloader) -> Self {
        Self {
            resolver,
            downloader,
            options: TransferOptions::default(),
        }
    }

    /// Override chunking and checkpoint settings. A progress callback in
    /// `options` is called for every episode, after the event is sent.
    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.downloader.state()
    }

    /// Begin a new session over `selected`
    pub async fn start(&mut self, series: &SeriesInfo, selected: BTreeSet<u32>) -> Result<()> {
        self.downloader.init_session(series, selected).await?;
        Ok(())
    }

    /// Pick up the session persisted in the output directory
    pub async fn resume(&mut self) -> Option<&SessionState> {
        self.downloader.load_session().await
    }

    /// Drop the session and its snapshot
    pub async fn clear(&mut self) -> Result<()> {
        self.downloader.clear_session().await
    }

    /// Download `episodes` in order
    ///
    /// One episode's failure never stops the batch; only a cancel signal
    /// does. Episodes already completed in the session are counted as
    /// successes without any network traffic.
    pub async fn run(
        &mut self,
        series_id: u64,
        episodes: &[u32],
        control: &ControlPlane,
        events: Option<&UnboundedSender<SessionEvent>>,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let emit = |event: SessionEvent| {
            if let Some(tx) = events {
                // Receiver gone means nobody is watching; keep going
                let _ = tx.send(event);
            }
        };

        for (index, &episode) in episodes.iter().enumerate() {
            if control.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let already_done = self
                .downloader
                .state()
                .is_some_and(|s| s.completed_episodes.contains(&episode));
            if already_done {
                emit(SessionEvent::EpisodeSkipped { episode });
                summary.succeeded += 1;
                continue;
            }

            emit(SessionEvent::EpisodeStarted {
                episode,
                position: index + 1,
                count: episodes.len(),
            });

            let descriptor = match self.resolver.resolve(series_id, episode).await {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => {
                    let err = Error::EpisodeNotFound { series_id, episode };
                    warn!("{err}");
                    emit(SessionEvent::EpisodeFailed {
                        episode,
                        reason: err.to_string(),
                    });
                    summary.failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Episode {episode}: {e}");
                    emit(SessionEvent::EpisodeFailed {
                        episode,
                        reason: e.to_string(),
                    });
                    summary.failed += 1;
                    continue;
                }
            };

            let mut options = self.options.clone();
            options.progress = progress_reporter(episode, events, self.options.progress.clone());

            match self.downloader.transfer(&descriptor, control, &options).await {
                TransferOutcome::Completed { bytes, .. } => {
                    emit(SessionEvent::EpisodeCompleted { episode, bytes });
                    summary.succeeded += 1;
                }
                TransferOutcome::Cancelled { downloaded } => {
                    emit(SessionEvent::EpisodeCancelled { episode, downloaded });
                    summary.cancelled = true;
                    break;
                }
                TransferOutcome::Failed(e) => {
                    emit(SessionEvent::EpisodeFailed {
                        episode,
                        reason: e.to_string(),
                    });
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Batch finished: {} succeeded, {} failed{}",
            summary.succeeded,
            summary.failed,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        summary
    }

    /// Final artifacts on disk for the selected episodes, ascending
    pub fn completed_artifacts(&self) -> Vec<PathBuf> {
        self.downloader
            .state()
            .map(|state| {
                state
                    .selected_episodes
                    .iter()
                    .map(|&ep| self.downloader.final_artifact_path(ep))
                    .filter(|path| path.exists())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Concatenate the downloaded episodes into one file
    ///
    /// Returns `Ok(None)` when fewer than two episodes are on disk. With
    /// `delete_after`, episode files are removed once the merge succeeded and
    /// the saved session is cleared, since it would list files that are gone.
    pub async fn merge<M: MergeService>(
        &mut self,
        merger: &M,
        title: Option<&str>,
        delete_after: bool,
    ) -> Result<Option<PathBuf>> {
        self.merge_with_progress(merger, title, delete_after, None)
            .await
    }

    /// [`merge`](Session::merge), reporting merge progress from 0.0 to 1.0
    pub async fn merge_with_progress<M: MergeService>(
        &mut self,
        merger: &M,
        title: Option<&str>,
        delete_after: bool,
        progress: Option<MergeProgressCallback>,
    ) -> Result<Option<PathBuf>> {
        if !merger.available() {
            return Err(Error::MergeFailed("FFmpeg not found".to_string()));
        }

        let inputs = self.completed_artifacts();
        if inputs.len() < 2 {
            info!("Not enough videos to merge (need at least 2, have {})", inputs.len());
            return Ok(None);
        }

        let file_name = match title.map(sanitize_filename) {
            Some(name) if !name.is_empty() => format!("{name}.mp4"),
            _ => "merged.mp4".to_string(),
        };
        let destination = self.downloader.output_dir().join(file_name);
        merger
            .merge_with_progress(&inputs, &destination, progress)
            .await?;
        info!("Merged video saved to {}", destination.display());

        if delete_after {
            remove_episode_files(&inputs).await;
            if let Err(e) = self.downloader.clear_session().await {
                warn!("Episodes merged but the saved session could not be cleared: {e}");
            }
        }
        Ok(Some(destination))
    }
}

/// Progress callback that forwards to the event channel, then to `inner`
fn progress_reporter(
    episode: u32,
    events: Option<&UnboundedSender<SessionEvent>>,
    inner: Option<ProgressCallback>,
) -> Option<ProgressCallback> {
    if events.is_none() && inner.is_none() {
        return None;
    }
    let tx = events.cloned();
    Some(Arc::new(move |downloaded: u64, total: u64, bytes_per_sec: f64| {
        if let Some(tx) = &tx {
            let _ = tx.send(SessionEvent::Progress {
                episode,
                downloaded,
                total,
                bytes_per_sec,
            });
        }
        if let Some(inner) = &inner {
            inner(downloaded, total, bytes_per_sec);
        }
    }))
}

async fn remove_episode_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Could not delete {}: {e}", path.display());
        }
    }
}

/// Episode files (`ep_*.mp4`) in `dir`, sorted by name
pub fn find_episode_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("ep_") && n.ends_with(".mp4"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Merge whatever episode files are already in `dir` into `dir/merged.mp4`
pub async fn merge_existing<M: MergeService>(merger: &M, dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Directory not found: {}",
            dir.display()
        )));
    }

    let files = find_episode_files(dir)?;
    if files.is_empty() {
        return Err(Error::InvalidInput(
            "No video files found matching pattern: ep_*.mp4".to_string(),
        ));
    }

    let destination = dir.join("merged.mp4");
    merger.merge(&files, &destination).await?;
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source::EpisodeDescriptor;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeResolver {
        urls: HashMap<u32, String>,
    }

    #[async_trait]
    impl EpisodeResolver for FakeResolver {
        async fn series_info(&self, series_id: u64) -> Result<SeriesInfo> {
            Ok(series(series_id, self.urls.len() as u32))
        }

        async fn resolve(&self, _series_id: u64, episode: u32) -> Result<Option<EpisodeDescriptor>> {
            Ok(self
                .urls
                .get(&episode)
                .map(|url| EpisodeDescriptor::new(episode, url.clone())))
        }
    }

    #[derive(Default)]
    struct RecordingMerger {
        calls: Mutex<Vec<(Vec<PathBuf>, PathBuf)>>,
    }

    #[async_trait]
    impl MergeService for RecordingMerger {
        fn available(&self) -> bool {
            true
        }

        async fn merge(&self, inputs: &[PathBuf], destination: &Path) -> Result<()> {
            std::fs::write(destination, b"merged")?;
            self.calls
                .lock()
                .unwrap()
                .push((inputs.to_vec(), destination.to_path_buf()));
            Ok(())
        }
    }

    fn series(series_id: u64, total: u32) -> SeriesInfo {
        SeriesInfo {
            series_id,
            title: "Test: Series".to_string(),
            total_episodes: total,
            poster_url: None,
            episode_urls: Default::default(),
        }
    }

    async fn serve_episodes(server: &MockServer, episodes: &[u32]) -> HashMap<u32, String> {
        let mut urls = HashMap::new();
        for &ep in episodes {
            let route = format!("/v/{ep}.mp4");
            Mock::given(method("GET"))
                .and(path(route.as_str()))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("content-length", "64")
                        .set_body_bytes(vec![ep as u8; 64]),
                )
                .mount(server)
                .await;
            urls.insert(ep, format!("{}{route}", server.uri()));
        }
        urls
    }

    #[tokio::test]
    async fn test_run_counts_and_events() {
        let server = MockServer::start().await;
        // Episode 2 resolves but the server has nothing
        let mut urls = serve_episodes(&server, &[1, 3]).await;
        urls.insert(2, format!("{}/v/2.mp4", server.uri()));

        let dir = tempdir().unwrap();
        let mut session = Session::new(FakeResolver { urls }, Downloader::new(dir.path()).unwrap());
        session
            .start(&series(941, 4), BTreeSet::from([1, 2, 3, 4]))
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let summary = session
            .run(941, &[1, 2, 3, 4], &ControlPlane::new(), Some(&tx))
            .await;
        drop(tx);

        assert_eq!(summary, BatchSummary { succeeded: 2, failed: 2, cancelled: false });
        assert_eq!(
            session.state().unwrap().completed_episodes,
            BTreeSet::from([1, 3])
        );

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut progress = 0;
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::EpisodeCompleted { episode, bytes } => {
                    assert_eq!(bytes, 64);
                    completed.push(episode);
                }
                SessionEvent::EpisodeFailed { episode, .. } => failed.push(episode),
                SessionEvent::Progress { .. } => progress += 1,
                _ => {}
            }
        }
        assert_eq!(completed, vec![1, 3]);
        assert_eq!(failed, vec![2, 4]);
        assert!(progress >= 2);
    }

    #[tokio::test]
    async fn test_completed_session_makes_no_requests() {
        let server = MockServer::start().await;
        let urls = serve_episodes(&server, &[1, 2]).await;

        let dir = tempdir().unwrap();
        let mut session = Session::new(FakeResolver { urls }, Downloader::new(dir.path()).unwrap());
        session
            .start(&series(941, 2), BTreeSet::from([1, 2]))
            .await
            .unwrap();
        let first = session.run(941, &[1, 2], &ControlPlane::new(), None).await;
        assert_eq!(first.succeeded, 2);
        let requests_after_first = server.received_requests().await.unwrap().len();

        // Fresh session object over the same directory
        let mut resumed = Session::new(
            FakeResolver { urls: HashMap::new() },
            Downloader::new(dir.path()).unwrap(),
        );
        let state = resumed.resume().await.unwrap();
        assert!(state.is_complete());

        let summary = resumed.run(941, &[1, 2], &ControlPlane::new(), None).await;
        assert_eq!(summary, BatchSummary { succeeded: 2, failed: 0, cancelled: false });
        assert_eq!(
            server.received_requests().await.unwrap().len(),
            requests_after_first
        );
    }

    #[tokio::test]
    async fn test_cancelled_batch_stops_without_failures() {
        let server = MockServer::start().await;
        let urls = serve_episodes(&server, &[1, 2]).await;

        let dir = tempdir().unwrap();
        let mut session = Session::new(FakeResolver { urls }, Downloader::new(dir.path()).unwrap());
        let control = ControlPlane::new();
        control.cancel();

        let summary = session.run(941, &[1, 2], &control, None).await;
        assert_eq!(summary, BatchSummary { succeeded: 0, failed: 0, cancelled: true });
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_uses_ascending_order_and_title() {
        let dir = tempdir().unwrap();
        let mut session = Session::new(
            FakeResolver { urls: HashMap::new() },
            Downloader::new(dir.path()).unwrap(),
        );
        session
            .start(&series(941, 10), BTreeSet::from([1, 2, 3, 10]))
            .await
            .unwrap();
        // Episode 4 is on disk but not selected
        for ep in [10, 4, 2, 1] {
            std::fs::write(session.downloader().final_artifact_path(ep), b"v").unwrap();
        }

        let merger = RecordingMerger::default();
        let merged = session
            .merge(&merger, Some("Test: Series"), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged, dir.path().join("Test Series.mp4"));

        let calls = merger.calls.lock().unwrap();
        let names: Vec<String> = calls[0]
            .0
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ep_001.mp4", "ep_002.mp4", "ep_010.mp4"]);

        // Episode files removed after a successful merge
        assert!(!session.downloader().final_artifact_path(1).exists());
        assert!(session.downloader().final_artifact_path(4).exists());
        assert!(merged.exists());

        // The session no longer describes anything on disk
        assert!(session.state().is_none());
        assert!(!dir.path().join(crate::core::state::STATE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_merge_keeping_episodes_keeps_session() {
        let dir = tempdir().unwrap();
        let mut session = Session::new(
            FakeResolver { urls: HashMap::new() },
            Downloader::new(dir.path()).unwrap(),
        );
        session
            .start(&series(941, 2), BTreeSet::from([1, 2]))
            .await
            .unwrap();
        for ep in [1, 2] {
            std::fs::write(session.downloader().final_artifact_path(ep), b"v").unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: MergeProgressCallback = Arc::new(move |fraction: f64| {
            sink.lock().unwrap().push(fraction);
        });
        let merger = RecordingMerger::default();
        let merged = session
            .merge_with_progress(&merger, None, false, Some(progress))
            .await
            .unwrap();

        assert_eq!(merged, Some(dir.path().join("merged.mp4")));
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
        assert!(session.downloader().final_artifact_path(1).exists());
        assert!(session.state().is_some());
        assert!(dir.path().join(crate::core::state::STATE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_merge_needs_two_episodes() {
        let dir = tempdir().unwrap();
        let mut session = Session::new(
            FakeResolver { urls: HashMap::new() },
            Downloader::new(dir.path()).unwrap(),
        );
        session
            .start(&series(941, 2), BTreeSet::from([1, 2]))
            .await
            .unwrap();
        std::fs::write(session.downloader().final_artifact_path(1), b"v").unwrap();

        let merger = RecordingMerger::default();
        let merged = session.merge(&merger, None, false).await.unwrap();
        assert!(merged.is_none());
        assert!(merger.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_existing() {
        let dir = tempdir().unwrap();
        for name in ["ep_002.mp4", "ep_001.mp4", "ep_003.mp4.part", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"v").unwrap();
        }

        let merger = RecordingMerger::default();
        let merged = merge_existing(&merger, dir.path()).await.unwrap();
        assert_eq!(merged, dir.path().join("merged.mp4"));

        let calls = merger.calls.lock().unwrap();
        assert_eq!(
            calls[0].0,
            vec![dir.path().join("ep_001.mp4"), dir.path().join("ep_002.mp4")]
        );
    }

    #[tokio::test]
    async fn test_merge_existing_empty_dir() {
        let dir = tempdir().unwrap();
        let merger = RecordingMerger::default();
        let err = merge_existing(&merger, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = merge_existing(&merger, &dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Directory not found"));
    }
}

//! Resumable episode transfers
//!
//! The [`Downloader`] owns one output directory and its session snapshot. A
//! transfer appends to `ep_NNN.mp4.part`, asking the server for the missing
//! byte range, and renames the file to `ep_NNN.mp4` only once every byte is on
//! disk. The rename is the commit point: a file under the final name is
//! always complete.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::core::control::ControlPlane;
use crate::core::error::{Error, Result};
use crate::core::source::{build_client, EpisodeDescriptor, SeriesInfo, SourceConfig};
use crate::core::state::{SessionState, StateStore};
use crate::core::stream::{create_http_stream, read_chunk, DownloadStream, TransferOptions};

/// Suffix appended to the final name while a transfer is incomplete
pub const PARTIAL_SUFFIX: &str = ".part";

/// Final artifact name; three digits keep lexical and numeric order aligned
pub fn episode_file_name(episode: u32) -> String {
    format!("ep_{episode:03}.mp4")
}

/// Result of one [`Downloader::transfer`] call
#[derive(Debug)]
pub enum TransferOutcome {
    /// Final artifact committed
    Completed { path: PathBuf, bytes: u64 },
    /// Stopped by the control plane; the partial artifact holds `downloaded` bytes
    Cancelled { downloaded: u64 },
    /// Transfer, storage or input failure
    Failed(Error),
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Completed { .. })
    }
}

/// How the response body relates to the partial artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Server honored the range: continue after the existing bytes
    Append,
    /// Server sent everything: start the partial artifact over
    Restart,
    /// Partial artifact already holds every byte; nothing to stream
    Complete,
}

/// How a streaming loop ended without an error
enum StreamEnd {
    Finished,
    Cancelled,
}

/// Parsed `Content-Range: bytes start-end/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    /// 0 when the header says `*`
    total: u64,
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => 0,
        t => t.parse().ok()?,
    };
    Some(ContentRange { start, total })
}

/// Total from the `Content-Range: bytes */total` of a 416 response
fn parse_unsatisfied_range(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes")?
        .trim_start()
        .strip_prefix("*/")?
        .trim()
        .parse()
        .ok()
}

/// Decide what to do with a response to a request made at `offset`
fn classify_response(response: &Response, offset: u64) -> Result<(WriteMode, u64)> {
    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            let range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            match range {
                Some(range) if range.start != offset => Err(Error::HttpError(format!(
                    "Server resumed at byte {} instead of {offset}",
                    range.start
                ))),
                Some(range) => Ok((WriteMode::Append, range.total)),
                None => {
                    debug!("Partial content without a usable Content-Range, size unknown");
                    Ok((WriteMode::Append, 0))
                }
            }
        }
        StatusCode::OK => {
            let total = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            Ok((WriteMode::Restart, total))
        }
        // A range starting at EOF: the previous run got every byte but
        // stopped before the rename
        StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_unsatisfied_range);
            match total {
                Some(total) if total == offset => Ok((WriteMode::Complete, total)),
                _ => Err(Error::HttpError(format!(
                    "Unexpected status {} for a resume at byte {offset}",
                    response.status()
                ))),
            }
        }
        status => Err(Error::HttpError(format!("Unexpected status {status}"))),
    }
}

/// Size of an existing partial artifact, 0 when there is none
async fn partial_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

/// Resumable downloader for one output directory
pub struct Downloader {
    client: Client,
    output_dir: PathBuf,
    store: StateStore,
    state: Option<SessionState>,
}

impl Downloader {
    /// Create a downloader with default configuration
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(output_dir, &SourceConfig::default())
    }

    /// Create a downloader with custom configuration; creates `output_dir`
    pub fn with_config(output_dir: impl AsRef<Path>, config: &SourceConfig) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            client: build_client(config)?,
            store: StateStore::new(&output_dir),
            output_dir,
            state: None,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Current in-memory session, if one was started or loaded
    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn final_artifact_path(&self, episode: u32) -> PathBuf {
        self.output_dir.join(episode_file_name(episode))
    }

    pub fn partial_artifact_path(&self, episode: u32) -> PathBuf {
        self.output_dir
            .join(format!("{}{PARTIAL_SUFFIX}", episode_file_name(episode)))
    }

    /// Start a fresh session for `selected` and persist it
    pub async fn init_session(
        &mut self,
        series: &SeriesInfo,
        selected: BTreeSet<u32>,
    ) -> Result<&SessionState> {
        let state = SessionState::new(
            series.series_id,
            series.title.clone(),
            series.total_episodes,
            self.output_dir.display().to_string(),
            selected,
        );
        self.store.save(&state).await?;
        Ok(self.state.insert(state))
    }

    /// Load the persisted session for this directory
    pub async fn load_session(&mut self) -> Option<&SessionState> {
        self.state = self.store.load().await;
        self.state.as_ref()
    }

    /// Forget the session and delete its snapshot
    pub async fn clear_session(&mut self) -> Result<()> {
        self.state = None;
        self.store.clear().await
    }

    /// Selected episodes still to download, ascending
    pub fn remaining_episodes(&self) -> Vec<u32> {
        self.state
            .as_ref()
            .map(SessionState::remaining_episodes)
            .unwrap_or_default()
    }

    async fn save_state(&self) -> Result<()> {
        match &self.state {
            Some(state) => self.store.save(state).await,
            None => Ok(()),
        }
    }

    /// Flush the partial artifact to disk, then record how much of it is there
    async fn checkpoint(
        &mut self,
        file: &mut File,
        episode: u32,
        downloaded: u64,
        total: u64,
    ) -> Result<()> {
        file.flush().await?;
        file.sync_data().await?;
        if let Some(state) = &mut self.state {
            state.set_checkpoint(episode, downloaded, total);
        }
        debug!("Checkpoint for episode {episode}: {downloaded}/{total} bytes");
        self.save_state().await
    }

    /// Transfer one episode, resuming from any partial artifact
    ///
    /// Never returns an error: every failure becomes
    /// [`TransferOutcome::Failed`]. Calling this again for the same episode
    /// after a failure or cancellation continues where the partial artifact
    /// ends.
    pub async fn transfer(
        &mut self,
        episode: &EpisodeDescriptor,
        control: &ControlPlane,
        options: &TransferOptions,
    ) -> TransferOutcome {
        if episode.url.trim().is_empty() {
            return TransferOutcome::Failed(Error::InvalidInput(format!(
                "Episode {} has no source URL",
                episode.episode
            )));
        }

        let number = episode.episode;
        let partial_path = self.partial_artifact_path(number);
        let offset = partial_size(&partial_path).await;

        let (response, mode, total) = match self.open_source(&episode.url, offset).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Episode {number}: {e}");
                if let Err(save_err) = self.save_state().await {
                    warn!("Failed to save session state: {save_err}");
                }
                return TransferOutcome::Failed(e);
            }
        };

        let opened = match mode {
            WriteMode::Append | WriteMode::Complete => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&partial_path)
                    .await
            }
            WriteMode::Restart => File::create(&partial_path).await,
        };
        let mut file = match opened {
            Ok(file) => file,
            Err(e) => return TransferOutcome::Failed(e.into()),
        };

        let mut downloaded = match mode {
            WriteMode::Append | WriteMode::Complete => offset,
            WriteMode::Restart => {
                if offset > 0 {
                    info!("Episode {number}: server ignored the range request, restarting from byte 0");
                }
                0
            }
        };

        if let Err(e) = self.checkpoint(&mut file, number, downloaded, total).await {
            return TransferOutcome::Failed(e);
        }

        let result = if mode == WriteMode::Complete {
            debug!("Episode {number}: partial artifact already complete ({offset} bytes)");
            Ok(StreamEnd::Finished)
        } else {
            let stream = create_http_stream(response);
            self.stream_to_partial(stream, &mut file, number, total, &mut downloaded, control, options)
                .await
        };

        match result {
            Ok(StreamEnd::Finished) => match self.commit(file, number, downloaded, total).await {
                Ok(path) => {
                    info!("Episode {number} complete: {downloaded} bytes");
                    TransferOutcome::Completed {
                        path,
                        bytes: downloaded,
                    }
                }
                Err(e) => {
                    warn!("Episode {number}: {e}");
                    if downloaded == 0 {
                        self.remove_partial(number).await;
                    }
                    TransferOutcome::Failed(e)
                }
            },
            Ok(StreamEnd::Cancelled) => {
                info!("Episode {number} cancelled at {downloaded} bytes");
                if downloaded == 0 {
                    drop(file);
                    self.remove_partial(number).await;
                    return TransferOutcome::Cancelled { downloaded };
                }
                match self.checkpoint(&mut file, number, downloaded, total).await {
                    Ok(()) => TransferOutcome::Cancelled { downloaded },
                    Err(e) => TransferOutcome::Failed(e),
                }
            }
            Err(e) => {
                warn!("Episode {number} interrupted at {downloaded} bytes: {e}");
                if downloaded == 0 {
                    drop(file);
                    self.remove_partial(number).await;
                } else if let Err(save_err) =
                    self.checkpoint(&mut file, number, downloaded, total).await
                {
                    warn!("Failed to save checkpoint: {save_err}");
                }
                TransferOutcome::Failed(e)
            }
        }
    }

    /// Delete a partial artifact that never received a byte
    async fn remove_partial(&self, episode: u32) {
        let path = self.partial_artifact_path(episode);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove {}: {e}", path.display());
            }
        }
    }

    /// Request the source, asking for the bytes after `offset` when resuming
    async fn open_source(&self, url: &str, offset: u64) -> Result<(Response, WriteMode, u64)> {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "*/*")
            .header(ACCEPT_ENCODING, "identity");
        if offset > 0 {
            debug!("Requesting range bytes={offset}-");
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let (mode, total) = classify_response(&response, offset)?;
        Ok((response, mode, total))
    }

    /// Copy the body into the partial artifact chunk by chunk
    #[allow(clippy::too_many_arguments)]
    async fn stream_to_partial(
        &mut self,
        mut stream: DownloadStream,
        file: &mut File,
        episode: u32,
        total: u64,
        downloaded: &mut u64,
        control: &ControlPlane,
        options: &TransferOptions,
    ) -> Result<StreamEnd> {
        let mut buffer = vec![0u8; options.chunk_size.max(1)];
        let checkpoint_interval = options.checkpoint_interval();
        let mut since_checkpoint = 0u64;
        let mut last_report = Instant::now();
        let mut since_report = 0u64;

        loop {
            control.wait_while_paused(options.pause_poll_interval).await;
            if control.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            let bytes_read = read_chunk(&mut stream, &mut buffer)
                .await
                .map_err(|e| Error::NetworkError(format!("Stream read error: {e}")))?;
            if bytes_read == 0 {
                break;
            }

            file.write_all(&buffer[..bytes_read]).await?;
            *downloaded += bytes_read as u64;
            since_checkpoint += bytes_read as u64;
            since_report += bytes_read as u64;

            if since_checkpoint >= checkpoint_interval {
                self.checkpoint(file, episode, *downloaded, total).await?;
                since_checkpoint = 0;
            }

            if let Some(ref progress) = options.progress {
                let elapsed = last_report.elapsed().as_secs_f64();
                let speed = if elapsed > 0.0 {
                    since_report as f64 / elapsed
                } else {
                    0.0
                };
                progress(*downloaded, total, speed);
                last_report = Instant::now();
                since_report = 0;
            }
        }

        Ok(StreamEnd::Finished)
    }

    /// Make the partial artifact final and record the episode as completed
    async fn commit(
        &mut self,
        mut file: File,
        episode: u32,
        downloaded: u64,
        total: u64,
    ) -> Result<PathBuf> {
        file.flush().await?;
        file.sync_all().await?;

        if total > 0 && downloaded != total {
            // Leave a resumable checkpoint behind for the truncated body
            self.checkpoint(&mut file, episode, downloaded, total).await?;
            return Err(Error::NetworkError(format!(
                "Transfer ended at {downloaded} of {total} bytes"
            )));
        }
        drop(file);

        let final_path = self.final_artifact_path(episode);
        tokio::fs::rename(self.partial_artifact_path(episode), &final_path).await?;

        if let Some(state) = &mut self.state {
            if !state.mark_completed(episode) {
                warn!("Episode {episode} is not part of the session selection");
            }
            state.clear_current();
        }
        // The final artifact is committed; a stale snapshot only costs a
        // re-check of this episode on the next run
        if let Err(e) = self.save_state().await {
            warn!("Episode {episode} saved but session state was not written: {e}");
        }

        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn series() -> SeriesInfo {
        SeriesInfo {
            series_id: 941,
            title: "Test Series".to_string(),
            total_episodes: 3,
            poster_url: None,
            episode_urls: Default::default(),
        }
    }

    fn small_chunks() -> TransferOptions {
        TransferOptions {
            chunk_size: 100,
            checkpoint_chunks: 2,
            pause_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn mount_full(server: &MockServer, route: &str, data: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", data.len().to_string().as_str())
                    .set_body_bytes(data.to_vec()),
            )
            .mount(server)
            .await;
    }

    async fn mount_range(server: &MockServer, route: &str, data: &[u8], offset: usize) {
        let content_range = format!("bytes {}-{}/{}", offset, data.len() - 1, data.len());
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("range", format!("bytes={offset}-").as_str()))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", content_range.as_str())
                    .set_body_bytes(data[offset..].to_vec()),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_episode_file_names() {
        assert_eq!(episode_file_name(7), "ep_007.mp4");
        assert_eq!(episode_file_name(70), "ep_070.mp4");
        assert_eq!(episode_file_name(700), "ep_700.mp4");
        assert!(episode_file_name(9) < episode_file_name(10));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 400-999/1000"),
            Some(ContentRange { start: 400, total: 1000 })
        );
        assert_eq!(
            parse_content_range("bytes 0-99/*"),
            Some(ContentRange { start: 0, total: 0 })
        );
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("items 1-2/3"), None);
        assert_eq!(parse_content_range(""), None);

        assert_eq!(parse_unsatisfied_range("bytes */1000"), Some(1000));
        assert_eq!(parse_unsatisfied_range("bytes 0-99/1000"), None);
        assert_eq!(parse_unsatisfied_range("bytes */*"), None);
    }

    #[tokio::test]
    async fn test_full_download_without_session() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        mount_full(&server, "/ep1.mp4", &data).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));

        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &TransferOptions::default())
            .await;

        match outcome {
            TransferOutcome::Completed { path, bytes } => {
                assert_eq!(bytes, 1000);
                assert_eq!(path, dir.path().join("ep_001.mp4"));
                assert_eq!(std::fs::read(&path).unwrap(), data);
            }
            other => panic!("Expected completion, got {other:?}"),
        }
        assert!(!downloader.partial_artifact_path(1).exists());
        assert!(!downloader.store().path().exists());
    }

    #[tokio::test]
    async fn test_resume_with_range_request() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        mount_range(&server, "/ep2.mp4", &data, 400).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        downloader
            .init_session(&series(), BTreeSet::from([1, 2, 3]))
            .await
            .unwrap();
        std::fs::write(downloader.partial_artifact_path(2), &data[..400]).unwrap();

        let episode = EpisodeDescriptor::new(2, format!("{}/ep2.mp4", server.uri()));
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &small_chunks())
            .await;
        assert!(outcome.is_success(), "{outcome:?}");

        let written = std::fs::read(downloader.final_artifact_path(2)).unwrap();
        assert_eq!(written.len(), 1000);
        assert_eq!(written, data);

        let state = downloader.state().unwrap();
        assert_eq!(state.completed_episodes, BTreeSet::from([2]));
        assert_eq!(state.current_episode, None);
        assert_eq!(state.current_progress, None);
    }

    #[tokio::test]
    async fn test_complete_partial_is_committed_on_unsatisfiable_range() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        Mock::given(method("GET"))
            .and(path("/ep1.mp4"))
            .and(header("range", "bytes=1000-"))
            .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */1000"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        downloader
            .init_session(&series(), BTreeSet::from([1, 2]))
            .await
            .unwrap();
        // Every byte arrived but the rename never happened
        std::fs::write(downloader.partial_artifact_path(1), &data).unwrap();

        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &small_chunks())
            .await;
        match outcome {
            TransferOutcome::Completed { bytes, .. } => assert_eq!(bytes, 1000),
            other => panic!("Expected completion, got {other:?}"),
        }

        assert_eq!(std::fs::read(downloader.final_artifact_path(1)).unwrap(), data);
        assert!(!downloader.partial_artifact_path(1).exists());
        let snapshot = downloader.store().load().await.unwrap();
        assert_eq!(snapshot.completed_episodes, BTreeSet::from([1]));
        assert_eq!(snapshot.current_episode, None);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_with_other_size_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ep1.mp4"))
            .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */800"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        std::fs::write(downloader.partial_artifact_path(1), test_data(1000)).unwrap();

        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &small_chunks())
            .await;
        assert!(matches!(outcome, TransferOutcome::Failed(Error::HttpError(_))));
        assert!(!downloader.final_artifact_path(1).exists());
        assert_eq!(std::fs::metadata(downloader.partial_artifact_path(1)).unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_full_content_discards_partial() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        // Range header is sent but ignored
        Mock::given(method("GET"))
            .and(path("/ep1.mp4"))
            .and(header("range", "bytes=300-"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "1000")
                    .set_body_bytes(data.clone()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        std::fs::write(downloader.partial_artifact_path(1), vec![b'X'; 300]).unwrap();

        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &small_chunks())
            .await;
        assert!(outcome.is_success(), "{outcome:?}");

        let written = std::fs::read(downloader.final_artifact_path(1)).unwrap();
        assert_eq!(written, data);
        assert!(!downloader.partial_artifact_path(1).exists());
    }

    #[tokio::test]
    async fn test_unexpected_status_fails_without_writing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        downloader
            .init_session(&series(), BTreeSet::from([1]))
            .await
            .unwrap();

        let episode = EpisodeDescriptor::new(1, format!("{}/missing.mp4", server.uri()));
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &TransferOptions::default())
            .await;

        match outcome {
            TransferOutcome::Failed(e) => assert!(e.is_transfer_error(), "{e:?}"),
            other => panic!("Expected failure, got {other:?}"),
        }
        assert!(!downloader.partial_artifact_path(1).exists());
        assert!(!downloader.final_artifact_path(1).exists());
        assert!(downloader.state().unwrap().completed_episodes.is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_range_start_is_rejected() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        // Server answers a resume at 400 with bytes from 500
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 500-999/1000")
                    .set_body_bytes(data[500..].to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        std::fs::write(downloader.partial_artifact_path(3), &data[..400]).unwrap();

        let episode = EpisodeDescriptor::new(3, format!("{}/ep3.mp4", server.uri()));
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &TransferOptions::default())
            .await;

        assert!(matches!(outcome, TransferOutcome::Failed(Error::HttpError(_))));
        assert_eq!(
            std::fs::read(downloader.partial_artifact_path(3)).unwrap(),
            &data[..400]
        );
    }

    #[tokio::test]
    async fn test_connection_failure_keeps_partial() {
        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        std::fs::write(downloader.partial_artifact_path(1), b"partial bytes").unwrap();

        let episode = EpisodeDescriptor::new(1, "http://127.0.0.1:1/ep1.mp4");
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &TransferOptions::default())
            .await;

        match outcome {
            TransferOutcome::Failed(Error::NetworkError(_)) => {}
            other => panic!("Expected network failure, got {other:?}"),
        }
        assert_eq!(
            std::fs::read(downloader.partial_artifact_path(1)).unwrap(),
            b"partial bytes"
        );
        assert!(!downloader.final_artifact_path(1).exists());
    }

    /// Answer one request with headers promising a body, then hang up
    async fn serve_headers_then_close() -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n")
                .await
                .unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/ep1.mp4")
    }

    #[tokio::test]
    async fn test_body_lost_before_first_byte_leaves_no_partial() {
        let url = serve_headers_then_close().await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        let episode = EpisodeDescriptor::new(1, url);
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &small_chunks())
            .await;

        assert!(matches!(outcome, TransferOutcome::Failed(_)), "{outcome:?}");
        assert!(!downloader.partial_artifact_path(1).exists());
        assert!(!downloader.final_artifact_path(1).exists());
    }

    #[tokio::test]
    async fn test_cancel_before_first_byte_leaves_no_partial() {
        let server = MockServer::start().await;
        mount_full(&server, "/ep1.mp4", &test_data(500)).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        let control = ControlPlane::new();
        control.cancel();

        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));
        let outcome = downloader.transfer(&episode, &control, &small_chunks()).await;
        assert!(matches!(outcome, TransferOutcome::Cancelled { downloaded: 0 }));
        assert!(!downloader.partial_artifact_path(1).exists());
    }

    #[tokio::test]
    async fn test_commit_survives_state_write_failure() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        mount_full(&server, "/ep1.mp4", &data).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        downloader
            .init_session(&series(), BTreeSet::from([1]))
            .await
            .unwrap();

        // Once the last chunk is checkpointed, block the snapshot's temp file
        let blocker = dir.path().join("download_state.json.tmp");
        let options = TransferOptions {
            progress: Some(Arc::new(move |downloaded: u64, total: u64, _speed: f64| {
                if downloaded == total {
                    let _ = std::fs::create_dir(&blocker);
                }
            })),
            ..small_chunks()
        };

        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));
        let outcome = downloader.transfer(&episode, &ControlPlane::new(), &options).await;

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(std::fs::read(downloader.final_artifact_path(1)).unwrap(), data);
        assert_eq!(
            downloader.state().unwrap().completed_episodes,
            BTreeSet::from([1])
        );
        // The snapshot on disk still holds the last checkpoint
        let snapshot = downloader.store().load().await.unwrap();
        assert!(snapshot.completed_episodes.is_empty());
    }

    #[tokio::test]
    async fn test_empty_url_is_rejected() {
        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        let outcome = downloader
            .transfer(
                &EpisodeDescriptor::new(1, "  "),
                &ControlPlane::new(),
                &TransferOptions::default(),
            )
            .await;
        assert!(matches!(outcome, TransferOutcome::Failed(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_cancel_then_resume() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        // Range mock first: it only matches the resumed request
        mount_range(&server, "/ep1.mp4", &data, 200).await;
        mount_full(&server, "/ep1.mp4", &data).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        downloader
            .init_session(&series(), BTreeSet::from([1, 2]))
            .await
            .unwrap();
        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));

        let control = ControlPlane::new();
        let trigger = control.clone();
        let options = TransferOptions {
            progress: Some(Arc::new(move |downloaded: u64, _total: u64, _speed: f64| {
                if downloaded >= 200 {
                    trigger.cancel();
                }
            })),
            ..small_chunks()
        };

        let outcome = downloader.transfer(&episode, &control, &options).await;
        match outcome {
            TransferOutcome::Cancelled { downloaded } => assert_eq!(downloaded, 200),
            other => panic!("Expected cancellation, got {other:?}"),
        }
        assert!(!downloader.final_artifact_path(1).exists());
        assert_eq!(
            std::fs::read(downloader.partial_artifact_path(1)).unwrap(),
            &data[..200]
        );

        let snapshot = downloader.store().load().await.unwrap();
        assert_eq!(snapshot.current_episode, Some(1));
        let progress = snapshot.current_progress.unwrap();
        assert_eq!(progress.downloaded_bytes, 200);
        assert_eq!(progress.total_bytes, 1000);
        assert!(snapshot.completed_episodes.is_empty());

        control.reset();
        let outcome = downloader
            .transfer(&episode, &control, &small_chunks())
            .await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(
            std::fs::read(downloader.final_artifact_path(1)).unwrap(),
            data
        );

        let snapshot = downloader.store().load().await.unwrap();
        assert_eq!(snapshot.completed_episodes, BTreeSet::from([1]));
        assert_eq!(snapshot.current_episode, None);
    }

    #[tokio::test]
    async fn test_checkpoints_bound_progress_loss() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        mount_full(&server, "/ep1.mp4", &data).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        downloader
            .init_session(&series(), BTreeSet::from([1]))
            .await
            .unwrap();

        let snapshot_path = downloader.store().path().to_path_buf();
        let violations = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&violations);
        let options = TransferOptions {
            progress: Some(Arc::new(move |downloaded: u64, total: u64, _speed: f64| {
                let json = std::fs::read(&snapshot_path).unwrap();
                let snapshot: SessionState = serde_json::from_slice(&json).unwrap();
                let saved = snapshot.current_progress.map(|p| p.downloaded_bytes).unwrap_or(0);
                // Checkpoints every 200 bytes, never ahead of the data
                if saved > downloaded || downloaded - saved >= 200 || total != 1000 {
                    seen.lock().unwrap().push((downloaded, saved));
                }
            })),
            ..small_chunks()
        };

        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));
        let outcome = downloader
            .transfer(&episode, &ControlPlane::new(), &options)
            .await;
        assert!(outcome.is_success());
        assert!(violations.lock().unwrap().is_empty(), "{:?}", violations.lock().unwrap());
    }

    #[tokio::test]
    async fn test_pause_holds_transfer_until_resumed() {
        let server = MockServer::start().await;
        let data = test_data(500);
        mount_full(&server, "/ep1.mp4", &data).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));

        let control = ControlPlane::new();
        control.pause();
        let handle = control.clone();
        let resumed = Arc::new(AtomicBool::new(false));
        let resumed_flag = Arc::clone(&resumed);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            resumed_flag.store(true, Ordering::SeqCst);
            handle.resume();
        });

        let progress_before_resume = Arc::new(AtomicBool::new(false));
        let early = Arc::clone(&progress_before_resume);
        let options = TransferOptions {
            progress: Some(Arc::new(move |_: u64, _: u64, _: f64| {
                if !resumed.load(Ordering::SeqCst) {
                    early.store(true, Ordering::SeqCst);
                }
            })),
            ..small_chunks()
        };

        let outcome = downloader.transfer(&episode, &control, &options).await;
        assert!(outcome.is_success());
        assert!(!progress_before_resume.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_progress_reports_cumulative_bytes() {
        let server = MockServer::start().await;
        let data = test_data(1000);
        mount_range(&server, "/ep1.mp4", &data, 600).await;

        let dir = tempdir().unwrap();
        let mut downloader = Downloader::new(dir.path()).unwrap();
        std::fs::write(downloader.partial_artifact_path(1), &data[..600]).unwrap();

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let options = TransferOptions {
            progress: Some(Arc::new(move |downloaded: u64, total: u64, speed: f64| {
                assert!(speed >= 0.0);
                sink.lock().unwrap().push((downloaded, total));
            })),
            ..small_chunks()
        };

        let episode = EpisodeDescriptor::new(1, format!("{}/ep1.mp4", server.uri()));
        assert!(downloader
            .transfer(&episode, &ControlPlane::new(), &options)
            .await
            .is_success());

        let reports = reports.lock().unwrap();
        assert_eq!(
            *reports,
            vec![(700, 1000), (800, 1000), (900, 1000), (1000, 1000)]
        );
    }
}

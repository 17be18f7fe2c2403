//! Persisted session state
//!
//! A session snapshot lives next to the episodes it describes, as
//! `download_state.json` in the output directory. It records which episodes
//! the user selected, which are finished, and (while a transfer is running or
//! after one was interrupted) how far the current episode got.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;

/// File name of the snapshot inside an output directory
pub const STATE_FILE_NAME: &str = "download_state.json";

/// Checkpoint of the episode currently being transferred
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub episode: u32,
    pub downloaded_bytes: u64,
    /// 0 when the server did not report a size
    pub total_bytes: u64,
    #[serde(default)]
    pub completed: bool,
}

/// Selection and progress of one series download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub series_id: u64,
    pub series_title: String,
    pub total_episodes: u32,
    pub output_dir: String,
    pub selected_episodes: BTreeSet<u32>,
    pub completed_episodes: BTreeSet<u32>,
    #[serde(default)]
    pub current_episode: Option<u32>,
    #[serde(default)]
    pub current_progress: Option<DownloadProgress>,
}

impl SessionState {
    /// Fresh session with nothing completed
    pub fn new(
        series_id: u64,
        series_title: impl Into<String>,
        total_episodes: u32,
        output_dir: impl Into<String>,
        selected_episodes: BTreeSet<u32>,
    ) -> Self {
        Self {
            series_id,
            series_title: series_title.into(),
            total_episodes,
            output_dir: output_dir.into(),
            selected_episodes,
            completed_episodes: BTreeSet::new(),
            current_episode: None,
            current_progress: None,
        }
    }

    /// Selected episodes not yet completed, ascending
    pub fn remaining_episodes(&self) -> Vec<u32> {
        self.selected_episodes
            .difference(&self.completed_episodes)
            .copied()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_episodes == self.selected_episodes
    }

    /// Record a checkpoint for the active transfer
    pub fn set_checkpoint(&mut self, episode: u32, downloaded_bytes: u64, total_bytes: u64) {
        self.current_episode = Some(episode);
        self.current_progress = Some(DownloadProgress {
            episode,
            downloaded_bytes,
            total_bytes,
            completed: false,
        });
    }

    pub fn clear_current(&mut self) {
        self.current_episode = None;
        self.current_progress = None;
    }

    /// Mark an episode finished. Episodes outside the selection are ignored
    /// so the completed set never grows past it. Returns whether it was recorded.
    pub fn mark_completed(&mut self, episode: u32) -> bool {
        if !self.selected_episodes.contains(&episode) {
            return false;
        }
        self.completed_episodes.insert(episode);
        true
    }

    /// Check the structural invariants of a snapshot
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.selected_episodes.contains(&0) {
            return Err("episode numbers must be positive".to_string());
        }
        if !self.completed_episodes.is_subset(&self.selected_episodes) {
            return Err("completed episodes are not a subset of the selection".to_string());
        }
        if let Some(progress) = &self.current_progress {
            if self.current_episode != Some(progress.episode) {
                return Err("current progress does not match the current episode".to_string());
            }
            if progress.total_bytes > 0 && progress.downloaded_bytes > progress.total_bytes {
                return Err("downloaded bytes exceed total bytes".to_string());
            }
        }
        Ok(())
    }
}

/// Durable storage for one output directory's snapshot
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store for the snapshot inside `output_dir`
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            path: output_dir.as_ref().join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a full snapshot
    ///
    /// The JSON is written to a sibling file and renamed into place, so a
    /// reader sees either the previous or the new snapshot. This is
    /// best-effort: there is no fsync of the directory entry.
    pub async fn save(&self, state: &SessionState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            "Saved session state: {}/{} completed",
            state.completed_episodes.len(),
            state.selected_episodes.len()
        );
        Ok(())
    }

    /// Load the snapshot. Missing, unreadable and malformed snapshots all
    /// come back as `None`.
    pub async fn load(&self) -> Option<SessionState> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("No session state at {}: {e}", self.path.display());
                return None;
            }
        };

        let state: SessionState = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                debug!("Ignoring malformed session state {}: {e}", self.path.display());
                return None;
            }
        };

        if let Err(reason) = state.validate() {
            debug!("Ignoring inconsistent session state {}: {reason}", self.path.display());
            return None;
        }

        Some(state)
    }

    /// Delete the snapshot if there is one
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

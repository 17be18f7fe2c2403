//! CLI-specific progress handling for rongyok-dl
//!
//! Renders session events as one progress bar per episode.

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use rongyok_dl::SessionEvent;

/// Creates a progress bar for CLI display with enhanced information
pub fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {bytes_per_sec} ETA: {eta}")
            .expect("Failed to create progress style")
            .progress_chars("#>-")
    );
    pb
}

/// Percentage bar for the merge step
pub fn create_merge_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}%")
            .expect("Failed to create progress style")
            .progress_chars("#>-")
    );
    pb.set_message("Merging");
    pb
}

/// Turns session events into terminal output
#[derive(Default)]
pub struct ProgressManager {
    pub pb: Option<ProgressBar>,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::EpisodeStarted { episode, position, count } => {
                self.finish_bar();
                eprintln!("📥 [{position}/{count}] Episode {episode}");
                let pb = create_progress_bar(0);
                pb.set_message(format!("EP{episode}"));
                self.pb = Some(pb);
            }
            SessionEvent::EpisodeSkipped { episode } => {
                eprintln!("⏭️  Episode {episode} already downloaded");
            }
            SessionEvent::Progress { downloaded, total, .. } => {
                if let Some(pb) = &self.pb {
                    if *total > 0 && pb.length() != Some(*total) {
                        pb.set_length(*total);
                    }
                    pb.set_position(*downloaded);
                }
            }
            SessionEvent::EpisodeCompleted { episode, bytes } => {
                if let Some(pb) = self.pb.take() {
                    pb.finish_and_clear();
                }
                eprintln!("✅ Episode {episode} done ({})", HumanBytes(*bytes));
            }
            SessionEvent::EpisodeFailed { episode, reason } => {
                if let Some(pb) = self.pb.take() {
                    pb.abandon();
                }
                eprintln!("❌ Episode {episode} failed: {reason}");
            }
            SessionEvent::EpisodeCancelled { episode, downloaded } => {
                if let Some(pb) = self.pb.take() {
                    pb.abandon();
                }
                eprintln!(
                    "⏸️  Episode {episode} stopped at {}; run again with --resume to continue",
                    HumanBytes(*downloaded)
                );
            }
        }
    }

    fn finish_bar(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
        }
    }
}

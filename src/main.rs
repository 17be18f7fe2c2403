//! # Rongyok-dl CLI
//!
//! Command-line interface for the rongyok-dl library.
//! Downloads episodic series from rongyok.com with resume support.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, warn};
use rongyok_dl::{
    merge_existing, parse_episode_selection, parse_series_url, BatchSummary, ControlPlane,
    Downloader, EpisodeResolver, FfmpegMerger, MergeProgressCallback, MergeService,
    RongyokResolver, Session, SessionEvent, SourceConfig,
};
use tokio::sync::mpsc;

mod cli;

use cli::create_merge_bar;

/// Command-line interface for rongyok-dl
#[derive(Parser, Debug)]
#[command(name = "rongyok-dl")]
#[command(about = "Resumable episode downloader for rongyok.com")]
#[command(long_about = "Downloads episodes of a rongyok.com series, one at a time:
  rongyok-dl https://rongyok.com/watch/?series_id=941                 # Download all episodes
  rongyok-dl https://rongyok.com/watch/?series_id=941 -e 1-10         # Download episodes 1 to 10
  rongyok-dl https://rongyok.com/watch/?series_id=941 -e 1,3,5 -y     # No confirmation prompt
  rongyok-dl --resume -o ./output                                     # Continue an interrupted session
  rongyok-dl --merge-only -o ./output                                 # Merge ep_*.mp4 already on disk

Interrupted downloads keep their .part file and continue where they stopped.
Press Ctrl-C to stop after the current chunk.")]
#[command(version = env!("RONGYOK_DL_VERSION"))]
struct Cli {
    /// Series URL (https://rongyok.com/watch/?series_id=N or /series/N/...)
    url: Option<String>,

    /// Episodes to download, e.g. "1-5,10,15-20" or "all"
    #[arg(short, long, default_value = "all")]
    episodes: String,

    /// Output directory
    #[arg(short, long, default_value = "./output")]
    output: PathBuf,

    /// Resume the session saved in the output directory
    #[arg(short, long)]
    resume: bool,

    /// Do not merge episodes after downloading
    #[arg(long)]
    no_merge: bool,

    /// Only merge the episode files already in the output directory
    #[arg(long)]
    merge_only: bool,

    /// List the selected episodes and exit
    #[arg(short, long)]
    list: bool,

    /// Start without asking for confirmation
    #[arg(short, long)]
    yes: bool,

    /// Keep the episode files after a successful merge
    #[arg(long)]
    keep_episodes: bool,

    /// Read timeout in seconds for each network read
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn source_config(&self) -> SourceConfig {
        let mut config = SourceConfig::default();
        if let Some(secs) = self.timeout {
            config.read_timeout = Duration::from_secs(secs.max(1));
        }
        config
    }
}

/// What the batch should download and how to label the merge
struct Plan {
    series_id: u64,
    title: String,
    episodes: Vec<u32>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    if cli.verbose {
        eprintln!("🎬 Rongyok-dl v{} starting...", env!("RONGYOK_DL_VERSION"));
    }

    let merger = FfmpegMerger::new();

    if cli.merge_only {
        let merged = merge_existing(&merger, &cli.output).await?;
        eprintln!("✅ Merged video saved to: {}", merged.display());
        return Ok(());
    }

    let config = cli.source_config();
    let resolver = RongyokResolver::with_config(config.clone())?;
    let mut session = Session::new(resolver, Downloader::with_config(&cli.output, &config)?);

    let plan = match resume_plan(&mut session, &cli).await {
        Some(plan) => plan,
        None => match fresh_plan(&mut session, &cli).await? {
            Some(plan) => plan,
            None => return Ok(()),
        },
    };

    if plan.episodes.is_empty() {
        eprintln!("✅ All episodes already downloaded!");
    } else {
        let (returned, summary) = download(session, &plan).await?;
        session = returned;
        print_summary(&summary);
        if summary.cancelled || summary.succeeded == 0 {
            return Ok(());
        }
    }

    if !cli.no_merge {
        merge_downloaded(&mut session, &merger, &plan.title, !cli.keep_episodes).await;
    }
    Ok(())
}

/// Load the saved session when `--resume` was given
async fn resume_plan(session: &mut Session<RongyokResolver>, cli: &Cli) -> Option<Plan> {
    if !cli.resume {
        return None;
    }
    let Some(state) = session.resume().await else {
        eprintln!("ℹ️  No previous download state found. Starting fresh.");
        return None;
    };

    eprintln!("🔄 Resuming download: {}", state.series_title);
    eprintln!(
        "   Completed: {}/{}",
        state.completed_episodes.len(),
        state.selected_episodes.len()
    );
    if let Some(progress) = &state.current_progress {
        eprintln!(
            "   Episode {} interrupted at {} bytes",
            progress.episode, progress.downloaded_bytes
        );
    }

    let remaining = state.remaining_episodes();
    if !remaining.is_empty() {
        eprintln!("   Remaining episodes: {remaining:?}");
    }
    Some(Plan {
        series_id: state.series_id,
        title: state.series_title.clone(),
        episodes: remaining,
    })
}

/// Resolve the series, select episodes and start a new session
///
/// Returns `Ok(None)` when there is nothing to download (list mode, or the
/// user declined).
async fn fresh_plan(session: &mut Session<RongyokResolver>, cli: &Cli) -> anyhow::Result<Option<Plan>> {
    let Some(url) = cli.url.as_deref() else {
        bail!("A series URL is required (or use --resume / --merge-only)");
    };
    let series_id = parse_series_url(url)
        .with_context(|| format!("Invalid URL. Could not extract series_id from: {url}"))?;

    eprintln!("🔍 Fetching series info for ID: {series_id}...");
    let series = session
        .resolver()
        .series_info(series_id)
        .await
        .context("Could not fetch series information")?;

    eprintln!("{}", "=".repeat(50));
    eprintln!("Series: {}", series.title);
    eprintln!("Total Episodes: {}", series.total_episodes);
    eprintln!("{}", "=".repeat(50));

    let selected = parse_episode_selection(&cli.episodes, series.total_episodes);
    if selected.is_empty() {
        bail!("No valid episodes selected");
    }

    if cli.list {
        println!("Selected episodes:");
        for ep in &selected {
            println!("  - Episode {ep}");
        }
        println!("\nTotal: {} episodes", selected.len());
        return Ok(None);
    }

    eprintln!("Selected episodes: {}", format_selection(&selected));
    eprintln!("📁 Output directory: {}", cli.output.display());

    if !cli.yes && !confirm(&format!("Download {} episodes?", selected.len()))? {
        eprintln!("Cancelled.");
        return Ok(None);
    }

    let episodes: Vec<u32> = selected.iter().copied().collect();
    session.start(&series, selected).await?;
    Ok(Some(Plan {
        series_id,
        title: series.title,
        episodes,
    }))
}

/// Ask a yes/no question on stderr; empty input means yes
fn confirm(question: &str) -> anyhow::Result<bool> {
    eprint!("\n{question} [Y/n]: ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    let answer = answer.trim().to_lowercase();
    answer.is_empty() || answer == "y" || answer == "yes"
}

/// Compact "1-5, 10" rendering of a selection
fn format_selection(selected: &BTreeSet<u32>) -> String {
    let mut parts = Vec::new();
    let mut iter = selected.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    parts.join(", ")
}

/// Run the batch on its own task, rendering events until it finishes
///
/// The first Ctrl-C cancels cooperatively; the partial file and checkpoint
/// stay on disk for `--resume`.
async fn download(
    mut session: Session<RongyokResolver>,
    plan: &Plan,
) -> anyhow::Result<(Session<RongyokResolver>, BatchSummary)> {
    eprintln!("\n🚀 Starting download of {} episodes...\n", plan.episodes.len());

    let control = ControlPlane::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();

    let task = {
        let control = control.clone();
        let series_id = plan.series_id;
        let episodes = plan.episodes.clone();
        tokio::spawn(async move {
            let summary = session.run(series_id, &episodes, &control, Some(&tx)).await;
            (session, summary)
        })
    };

    let mut progress = cli::ProgressManager::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => progress.handle(&event),
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(e) = signal {
                    warn!("Could not listen for Ctrl-C: {e}");
                }
                eprintln!("\n⏹️  Stopping after the current chunk...");
                control.cancel();
                interrupted = true;
            }
        }
    }

    task.await.context("Download task panicked")
}

fn print_summary(summary: &BatchSummary) {
    eprintln!("\n{}", "=".repeat(50));
    if summary.cancelled {
        eprintln!("Download stopped. Run again with --resume to continue.");
    } else {
        eprintln!("Download Complete!");
    }
    eprintln!("  Successful: {}", summary.succeeded);
    eprintln!("  Failed: {}", summary.failed);
    eprintln!("{}", "=".repeat(50));
}

async fn merge_downloaded<M: MergeService>(
    session: &mut Session<RongyokResolver>,
    merger: &M,
    title: &str,
    delete_after: bool,
) {
    if !merger.available() {
        eprintln!("\n⚠️  FFmpeg not found. Cannot merge videos.");
        eprintln!("Install FFmpeg to enable video merging:");
        eprintln!("  macOS: brew install ffmpeg");
        eprintln!("  Ubuntu: sudo apt install ffmpeg");
        return;
    }

    eprintln!("\n🎞️  Merging episodes...");
    let pb = create_merge_bar();
    let bar = pb.clone();
    let progress: MergeProgressCallback = Arc::new(move |fraction: f64| {
        bar.set_position((fraction * 100.0).round() as u64);
    });
    let result = session
        .merge_with_progress(merger, Some(title), delete_after, Some(progress))
        .await;
    pb.finish_and_clear();

    match result {
        Ok(Some(path)) => {
            eprintln!("✅ Merged video saved to: {}", display_path(&path));
            if delete_after {
                eprintln!("🧹 Removed individual episode files");
            }
        }
        Ok(None) => eprintln!("ℹ️  Not enough videos to merge (need at least 2)"),
        Err(e) => eprintln!("❌ Merge failed: {e}"),
    }
}

fn display_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#![forbid(unsafe_code)]

//! Download orchestration for one playlist job.
//!
//! Two strategies share one contract: given a playlist URL and an empty job
//! directory, leave finished files in that directory and report what happened.
//!
//! * `Delegated` hands the whole playlist to yt-dlp, which picks formats, merges
//!   streams and names files itself. Any failure fails the job.
//! * `Manual` resolves the playlist first and then fetches video and audio for
//!   each item separately before muxing them with ffmpeg. A failing item is
//!   recorded and skipped; the loop always reaches the end of the playlist.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{
    error::{PlaylistError, PlaylistResult},
    media::{AUDIO_ONLY_FORMAT, FlatEntry, MERGE_CONTAINER, MediaTool, VIDEO_ONLY_FORMAT},
    naming::{escape_output_template, sanitize_filename, truncate_to_bytes},
    resolver::{RetryPolicy, UNTITLED_ITEM, resolve_entries},
    workspace::finished_files,
};

/// Default and upper bound for the title part of a file name. Leaves room
/// under the usual 255-byte name limit for suffixes such as `_video.mp4`.
pub const DEFAULT_MAX_TITLE_BYTES: usize = 200;
/// Bound for the item id appended when two titles collide.
const COLLISION_TAG_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStrategy {
    #[default]
    Delegated,
    Manual,
}

impl DownloadStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "delegated" | "ytdlp" | "yt-dlp" => Some(Self::Delegated),
            "manual" | "mux" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub strategy: DownloadStrategy,
    pub max_title_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            strategy: DownloadStrategy::default(),
            max_title_bytes: DEFAULT_MAX_TITLE_BYTES,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Downloaded(PathBuf),
    /// The final file was already on disk.
    Skipped(PathBuf),
    Failed {
        title: String,
        reason: String,
    },
}

/// Per-item results of a job, in playlist order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.count(|outcome| matches!(outcome, ItemOutcome::Downloaded(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, ItemOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, ItemOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| predicate(outcome)).count()
    }
}

/// Runs one download job into `dir` using the configured strategy.
pub async fn run_job(
    tool: &dyn MediaTool,
    url: &str,
    dir: &Path,
    options: &JobOptions,
) -> PlaylistResult<BatchReport> {
    tracing::info!(url, strategy = options.strategy.as_str(), "starting download job");
    let report = match options.strategy {
        DownloadStrategy::Delegated => run_delegated(tool, url, dir, options).await?,
        DownloadStrategy::Manual => run_manual(tool, url, dir, options).await?,
    };
    tracing::info!(
        succeeded = report.succeeded(),
        skipped = report.skipped(),
        failed = report.failed(),
        "download job finished"
    );
    Ok(report)
}

/// yt-dlp output template that names files after the item title, cut to a
/// byte budget.
pub fn output_template(dir: &Path, max_title_bytes: usize) -> String {
    let budget = max_title_bytes.min(DEFAULT_MAX_TITLE_BYTES);
    let dir = escape_output_template(&dir.to_string_lossy());
    format!("{dir}/%(title).{budget}B.%(ext)s")
}

async fn run_delegated(
    tool: &dyn MediaTool,
    url: &str,
    dir: &Path,
    options: &JobOptions,
) -> PlaylistResult<BatchReport> {
    let template = output_template(dir, options.max_title_bytes);
    tool.download_playlist(url, &template).await?;

    let outcomes = finished_files(dir)?
        .into_iter()
        .map(ItemOutcome::Downloaded)
        .collect();
    Ok(BatchReport { outcomes })
}

async fn run_manual(
    tool: &dyn MediaTool,
    url: &str,
    dir: &Path,
    options: &JobOptions,
) -> PlaylistResult<BatchReport> {
    let playlist = resolve_entries(tool, url, options.retry).await?;
    let total = playlist.entries.len();
    let mut report = BatchReport::default();
    let mut used_stems = HashSet::new();

    for (index, entry) in playlist.entries.iter().enumerate() {
        let position = index + 1;
        let title = entry
            .title
            .clone()
            .unwrap_or_else(|| UNTITLED_ITEM.to_string());
        let stem = unique_stem(
            item_file_stem(entry, position, options.max_title_bytes),
            entry,
            position,
            &mut used_stems,
        );

        let outcome = match process_item(tool, entry, &stem, position, dir).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(position, total, title = %title, error = %err, "item failed, continuing");
                ItemOutcome::Failed {
                    title,
                    reason: err.to_string(),
                }
            }
        };
        report.outcomes.push(outcome);
    }

    Ok(report)
}

async fn process_item(
    tool: &dyn MediaTool,
    entry: &FlatEntry,
    stem: &str,
    position: usize,
    dir: &Path,
) -> PlaylistResult<ItemOutcome> {
    let final_path = dir.join(format!("{stem}.{MERGE_CONTAINER}"));

    if tokio::fs::try_exists(&final_path).await? {
        tracing::info!(position, file = %final_path.display(), "already downloaded, skipping");
        return Ok(ItemOutcome::Skipped(final_path));
    }

    let item_url = entry
        .watch_url()
        .ok_or_else(|| PlaylistError::download("item has no downloadable URL"))?;
    let video_path = dir.join(format!("{stem}_video.mp4"));
    let audio_path = dir.join(format!("{stem}_audio.m4a"));

    tracing::info!(position, item = %item_url, file = %final_path.display(), "downloading item");
    let result = fetch_and_mux(tool, &item_url, &video_path, &audio_path, &final_path).await;

    remove_if_present(&video_path).await;
    remove_if_present(&audio_path).await;
    if result.is_err() {
        remove_if_present(&final_path).await;
    }

    result.map(|()| ItemOutcome::Downloaded(final_path))
}

async fn fetch_and_mux(
    tool: &dyn MediaTool,
    item_url: &str,
    video_path: &Path,
    audio_path: &Path,
    final_path: &Path,
) -> PlaylistResult<()> {
    tool.download_format(item_url, VIDEO_ONLY_FORMAT, video_path)
        .await?;
    ensure_produced(video_path, "video stream").await?;

    tool.download_format(item_url, AUDIO_ONLY_FORMAT, audio_path)
        .await?;
    ensure_produced(audio_path, "audio stream").await?;

    tool.mux(video_path, audio_path, final_path).await?;
    ensure_produced(final_path, "muxed file").await
}

async fn ensure_produced(path: &Path, what: &str) -> PlaylistResult<()> {
    if tokio::fs::try_exists(path).await? {
        Ok(())
    } else {
        Err(PlaylistError::download(format!("no {what} was produced")))
    }
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(file = %path.display(), error = %err, "could not remove temporary file")
        }
    }
}

/// File name (without extension) for a manually downloaded item. Titles that
/// sanitize to nothing fall back to the item id, then to the position.
fn item_file_stem(entry: &FlatEntry, position: usize, max_title_bytes: usize) -> String {
    let budget = max_title_bytes.min(DEFAULT_MAX_TITLE_BYTES);
    [entry.title.as_deref(), entry.id.as_deref()]
        .into_iter()
        .flatten()
        .map(sanitize_filename)
        .map(|name| truncate_to_bytes(name.trim(), budget).trim_end().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| format!("item-{position}"))
}

/// Keeps two items of one playlist from sharing a file. A repeated stem gets
/// the item id (or position) appended; the choice depends only on playlist
/// order, so a re-run maps every item to the same file again.
fn unique_stem(
    stem: String,
    entry: &FlatEntry,
    position: usize,
    used: &mut HashSet<String>,
) -> String {
    if used.insert(stem.clone()) {
        return stem;
    }
    let tag = entry
        .id
        .as_deref()
        .map(sanitize_filename)
        .map(|id| truncate_to_bytes(id.trim(), COLLISION_TAG_BYTES).to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| position.to_string());
    let mut candidate = format!("{stem} [{tag}]");
    if !used.insert(candidate.clone()) {
        candidate = format!("{stem} [{position}]");
        used.insert(candidate.clone());
    }
    tracing::info!(position, file_stem = %candidate, "title collides with an earlier item");
    candidate
}

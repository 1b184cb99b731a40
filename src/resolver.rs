#![forbid(unsafe_code)]

//! Playlist metadata lookup ("flat" extraction, nothing is downloaded).

use std::time::Duration;

use serde::Serialize;

use crate::{
    error::{PlaylistError, PlaylistResult},
    media::{FlatEntry, FlatPlaylist, MediaTool},
};

pub const UNTITLED_PLAYLIST: &str = "Untitled Playlist";
pub const UNTITLED_ITEM: &str = "Untitled";
/// Preview responses never carry live progress.
pub const PENDING_PROGRESS: &str = "0%";

/// Preview payload, serialized with the field names the frontend expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistSummary {
    #[serde(rename = "playlist_title")]
    pub title: String,
    #[serde(rename = "video_count")]
    pub item_count: usize,
    #[serde(rename = "videos")]
    pub items: Vec<ItemSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSummary {
    pub title: String,
    #[serde(rename = "thumbnail")]
    pub thumbnail_url: String,
    pub progress: String,
}

/// Retry settings for the metadata call. Timeouts are never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Playlist entries that can actually be acted upon.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    pub title: String,
    pub entries: Vec<FlatEntry>,
}

impl ResolvedPlaylist {
    pub fn summary(&self) -> PlaylistSummary {
        let items = self
            .entries
            .iter()
            .map(|entry| ItemSummary {
                title: entry
                    .title
                    .clone()
                    .unwrap_or_else(|| UNTITLED_ITEM.to_string()),
                thumbnail_url: entry.best_thumbnail().unwrap_or_default().to_string(),
                progress: PENDING_PROGRESS.to_string(),
            })
            .collect::<Vec<_>>();

        PlaylistSummary {
            title: self.title.clone(),
            item_count: items.len(),
            items,
        }
    }
}

impl TryFrom<FlatPlaylist> for ResolvedPlaylist {
    type Error = PlaylistError;

    /// A missing entry list and an empty one are both "no entries".
    fn try_from(playlist: FlatPlaylist) -> PlaylistResult<Self> {
        let entries: Vec<FlatEntry> = playlist
            .entries
            .ok_or_else(PlaylistError::no_entries)?
            .into_iter()
            .flatten()
            .collect();
        if entries.is_empty() {
            return Err(PlaylistError::no_entries());
        }

        Ok(Self {
            title: playlist
                .title
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| UNTITLED_PLAYLIST.to_string()),
            entries,
        })
    }
}

/// Runs the flat extraction with bounded exponential backoff and keeps only
/// usable entries.
pub async fn resolve_entries(
    tool: &dyn MediaTool,
    url: &str,
    policy: RetryPolicy,
) -> PlaylistResult<ResolvedPlaylist> {
    let mut attempt = 0;
    let playlist = loop {
        match tool.flat_playlist(url).await {
            Ok(playlist) => break playlist,
            Err(err) if err.is_timeout() || attempt >= policy.retries => {
                tracing::warn!(url, error = %err, "playlist resolution failed");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                attempt += 1;
                tracing::warn!(
                    url,
                    attempt,
                    retries = policy.retries,
                    ?delay,
                    error = %err,
                    "playlist resolution failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    let resolved = ResolvedPlaylist::try_from(playlist)?;
    tracing::info!(
        title = %resolved.title,
        entries = resolved.entries.len(),
        "resolved playlist"
    );
    Ok(resolved)
}

/// Preview operation: metadata only, no filesystem side effects.
pub async fn resolve_playlist(
    tool: &dyn MediaTool,
    url: &str,
    policy: RetryPolicy,
) -> PlaylistResult<PlaylistSummary> {
    resolve_entries(tool, url, policy)
        .await
        .map(|resolved| resolved.summary())
}

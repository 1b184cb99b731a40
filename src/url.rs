#![forbid(unsafe_code)]

//! Extracts the canonical playlist link from whatever the user pasted.

use std::sync::LazyLock;

use regex::Regex;

static PLAYLIST_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(https?://)?(www\.)?(youtube\.com|youtu\.be)/playlist\?list=[\w-]+")
        .expect("playlist pattern compiles")
});

/// Returns the first playlist link found in `input`, or `input` unchanged when
/// nothing matches. Validity is left to the resolver/downloader.
pub fn normalize_playlist_url(input: &str) -> String {
    let normalized = PLAYLIST_LINK
        .find(input)
        .map(|found| found.as_str().to_string())
        .unwrap_or_else(|| input.to_string());
    tracing::debug!(input, normalized = %normalized, "normalized playlist url");
    normalized
}

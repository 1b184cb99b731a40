#![forbid(unsafe_code)]

//! File naming helpers for downloaded items.

/// Characters that are reserved on at least one of the filesystems we write to.
pub const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Removes every reserved character from `title`. Distinct titles may collapse
/// to the same name; the caller decides what a collision means.
pub fn sanitize_filename(title: &str) -> String {
    title
        .chars()
        .filter(|c| !RESERVED_CHARS.contains(c))
        .collect()
}

/// Caps `title` at `max_bytes` bytes of UTF-8 without splitting a character.
/// Filesystems limit names in bytes, not characters.
pub fn truncate_to_bytes(title: &str, max_bytes: usize) -> &str {
    if title.len() <= max_bytes {
        return title;
    }
    let mut end = max_bytes;
    while !title.is_char_boundary(end) {
        end -= 1;
    }
    &title[..end]
}

/// Makes `path` safe to hand to yt-dlp's `--output`, which is a template where
/// `%` starts a field.
pub fn escape_output_template(path: &str) -> String {
    path.replace('%', "%%")
}

#![forbid(unsafe_code)]

//! Seam between the service and the external media tools.
//!
//! `yt-dlp` does every network-facing step (flat listing, format selection,
//! downloads) and `ffmpeg` combines separate audio/video streams. Both run as
//! child processes with `kill_on_drop`, so dropping a request future also stops
//! the process it started. Every call is bounded by a timeout.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::{
    error::{PlaylistError, PlaylistResult},
    naming::escape_output_template,
};

pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";

/// Format selector used when yt-dlp handles the whole playlist itself.
pub const MERGED_FORMAT: &str = "bestvideo[height<=1080]+bestaudio/best";
/// Video-only stream picked per item by the manual strategy.
pub const VIDEO_ONLY_FORMAT: &str = "bestvideo[height<=1080][ext=mp4]/bestvideo[height<=1080]";
/// Audio-only stream picked per item by the manual strategy.
pub const AUDIO_ONLY_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio";
pub const MERGE_CONTAINER: &str = "mp4";

const STDERR_TAIL_BYTES: usize = 300;

/// Subset of `yt-dlp --flat-playlist --dump-single-json` we rely on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlatPlaylist {
    pub title: Option<String>,
    /// `None` when the URL did not resolve to a list at all. Unavailable videos
    /// show up as `null` elements.
    pub entries: Option<Vec<Option<FlatEntry>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlatEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnails: Option<Vec<Thumbnail>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thumbnail {
    pub url: Option<String>,
}

impl FlatEntry {
    /// URL that yt-dlp can download this single item from.
    pub fn watch_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref()
            && url.starts_with("http")
        {
            return Some(url.to_string());
        }
        self.id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| format!("https://www.youtube.com/watch?v={id}"))
    }

    /// Last thumbnail in the list, which yt-dlp orders by increasing size.
    pub fn best_thumbnail(&self) -> Option<&str> {
        self.thumbnails
            .as_ref()?
            .iter()
            .rev()
            .find_map(|thumb| thumb.url.as_deref())
    }
}

/// Operations the resolver and orchestrator need from the outside world.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Lists playlist metadata without downloading media.
    async fn flat_playlist(&self, url: &str) -> PlaylistResult<FlatPlaylist>;

    /// Downloads every item of `url`, merged into one container per item,
    /// naming files through the yt-dlp `output_template`.
    async fn download_playlist(&self, url: &str, output_template: &str) -> PlaylistResult<()>;

    /// Downloads one stream of a single item to exactly `dest`.
    async fn download_format(&self, item_url: &str, format: &str, dest: &Path)
    -> PlaylistResult<()>;

    /// Combines a video-only and an audio-only file into `dest`.
    async fn mux(&self, video: &Path, audio: &Path, dest: &Path) -> PlaylistResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ToolTimeouts {
    pub metadata: Duration,
    pub download: Duration,
    pub mux: Duration,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(120),
            download: Duration::from_secs(3600),
            mux: Duration::from_secs(900),
        }
    }
}

/// Process-backed [`MediaTool`].
#[derive(Debug, Clone)]
pub struct YtDlp {
    ytdlp: PathBuf,
    ffmpeg: PathBuf,
    timeouts: ToolTimeouts,
}

impl YtDlp {
    pub fn new(
        ytdlp: impl Into<PathBuf>,
        ffmpeg: impl Into<PathBuf>,
        timeouts: ToolTimeouts,
    ) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            ffmpeg: ffmpeg.into(),
            timeouts,
        }
    }

    fn ytdlp_command(&self) -> Command {
        let mut command = Command::new(&self.ytdlp);
        command.arg("--no-warnings").arg("--no-progress");
        if self.ffmpeg != Path::new(DEFAULT_FFMPEG_BIN) {
            command.arg("--ffmpeg-location").arg(&self.ffmpeg);
        }
        command
    }
}

#[async_trait]
impl MediaTool for YtDlp {
    async fn flat_playlist(&self, url: &str) -> PlaylistResult<FlatPlaylist> {
        let mut command = self.ytdlp_command();
        command
            .arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--quiet")
            .arg(url);

        let stdout = run_tool(
            command,
            "flat playlist extraction",
            self.timeouts.metadata,
            |message| PlaylistError::resolution(message),
        )
        .await?;

        serde_json::from_slice(&stdout).map_err(|err| {
            PlaylistError::resolution(format!("unreadable playlist metadata: {err}"))
        })
    }

    async fn download_playlist(&self, url: &str, output_template: &str) -> PlaylistResult<()> {
        let mut command = self.ytdlp_command();
        command
            .arg("--yes-playlist")
            .arg("--format")
            .arg(MERGED_FORMAT)
            .arg("--merge-output-format")
            .arg(MERGE_CONTAINER)
            .arg("--output")
            .arg(output_template)
            .arg(url);

        run_tool(
            command,
            "playlist download",
            self.timeouts.download,
            |message| PlaylistError::download(message),
        )
        .await
        .map(drop)
    }

    async fn download_format(
        &self,
        item_url: &str,
        format: &str,
        dest: &Path,
    ) -> PlaylistResult<()> {
        let mut command = self.ytdlp_command();
        command
            .arg("--no-playlist")
            .arg("--force-overwrites")
            .arg("--format")
            .arg(format)
            .arg("--output")
            .arg(escape_output_template(&dest.to_string_lossy()))
            .arg(item_url);

        run_tool(
            command,
            "stream download",
            self.timeouts.download,
            |message| PlaylistError::download(message),
        )
        .await
        .map(drop)
    }

    async fn mux(&self, video: &Path, audio: &Path, dest: &Path) -> PlaylistResult<()> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(audio)
            .arg("-map")
            .arg("0:v:0")
            .arg("-map")
            .arg("1:a:0")
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("aac")
            .arg(dest);

        run_tool(command, "muxing", self.timeouts.mux, |message| {
            PlaylistError::download(message)
        })
        .await
        .map(drop)
    }
}

/// Runs `command` to completion and returns its stdout. Spawn failures and
/// non-zero exits are turned into errors through `fail`.
async fn run_tool(
    mut command: Command,
    operation: &str,
    limit: Duration,
    fail: fn(String) -> PlaylistError,
) -> PlaylistResult<Vec<u8>> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(operation, command = ?command.as_std(), "spawning external tool");
    let child = command
        .spawn()
        .map_err(|err| fail(format!("{operation}: could not launch tool: {err}")))?;

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::warn!(operation, seconds = limit.as_secs(), "external tool timed out");
            return Err(PlaylistError::timeout(operation, limit.as_secs()));
        }
    };

    if !output.status.success() {
        let detail = stderr_tail(&output.stderr);
        tracing::warn!(operation, status = %output.status, detail, "external tool failed");
        return Err(fail(if detail.is_empty() {
            format!("{operation} failed ({})", output.status)
        } else {
            format!("{operation} failed: {detail}")
        }));
    }

    Ok(output.stdout)
}

/// Last meaningful stderr line, which is where yt-dlp and ffmpeg print the
/// actual error.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("");
    crate::naming::truncate_to_bytes(line, STDERR_TAIL_BYTES).to_string()
}

/// Runs `<name> -version`/`--version` to fail loudly when a tool is missing.
pub fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = std::process::Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!("{} is not installed or not in PATH: {}", program.display(), err),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        fake::install_script(dir, "yt-dlp", body)
    }

    fn tool_with(stub: PathBuf, timeouts: ToolTimeouts) -> YtDlp {
        YtDlp::new(stub, DEFAULT_FFMPEG_BIN, timeouts)
    }

    #[tokio::test]
    async fn flat_playlist_parses_stub_output() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"cat <<'EOF'
{"title": "Mix", "entries": [
  {"id": "a1", "title": "First", "thumbnails": [{"url": "s.jpg"}, {"url": "l.jpg"}]},
  null,
  {"id": "b2", "title": "Second"}
]}
EOF"#,
        );
        let playlist = tool_with(stub, ToolTimeouts::default())
            .flat_playlist("https://www.youtube.com/playlist?list=PL1")
            .await
            .unwrap();
        assert_eq!(playlist.title.as_deref(), Some("Mix"));
        let entries = playlist.entries.unwrap();
        assert_eq!(entries.len(), 3);
        let first = entries[0].as_ref().unwrap();
        assert_eq!(first.best_thumbnail(), Some("l.jpg"));
        assert_eq!(
            first.watch_url().as_deref(),
            Some("https://www.youtube.com/watch?v=a1")
        );
        assert!(entries[1].is_none());
    }

    #[tokio::test]
    async fn failing_tool_reports_last_stderr_line() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo 'WARNING: noise' >&2\necho 'ERROR: playlist does not exist' >&2\nexit 1",
        );
        let err = tool_with(stub, ToolTimeouts::default())
            .flat_playlist("https://www.youtube.com/playlist?list=missing")
            .await
            .unwrap_err();
        assert!(matches!(err, PlaylistError::Resolution { .. }));
        assert!(err.to_string().contains("ERROR: playlist does not exist"));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "sleep 5");
        let timeouts = ToolTimeouts {
            metadata: Duration::from_millis(200),
            ..ToolTimeouts::default()
        };
        let err = tool_with(stub, timeouts)
            .flat_playlist("https://www.youtube.com/playlist?list=slow")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn missing_binary_is_a_download_error() {
        let tool = YtDlp::new(
            "/nonexistent/yt-dlp",
            DEFAULT_FFMPEG_BIN,
            ToolTimeouts::default(),
        );
        let err = tool
            .download_playlist("https://www.youtube.com/playlist?list=x", "/tmp/%(title)s.%(ext)s")
            .await
            .unwrap_err();
        assert!(matches!(err, PlaylistError::Download(_)));
        assert!(err.to_string().contains("could not launch tool"));
    }

    #[tokio::test]
    async fn download_format_escapes_percent_in_destination() {
        let dir = tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let stub = install_stub(
            dir.path(),
            &format!("printf '%s\\n' \"$@\" > '{}'", args_file.display()),
        );
        let dest = dir.path().join("100% Hits_video.mp4");
        tool_with(stub, ToolTimeouts::default())
            .download_format("https://www.youtube.com/watch?v=a1", VIDEO_ONLY_FORMAT, &dest)
            .await
            .unwrap();

        let args = std::fs::read_to_string(&args_file).unwrap();
        let args: Vec<&str> = args.lines().collect();
        let output = args.iter().position(|arg| *arg == "--output").unwrap();
        assert_eq!(
            args[output + 1],
            format!("{}/100%% Hits_video.mp4", dir.path().display())
        );
        assert_eq!(args.last(), Some(&"https://www.youtube.com/watch?v=a1"));
    }

    #[tokio::test]
    async fn dropping_a_call_kills_the_tool() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let stub = install_stub(
            dir.path(),
            &format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()),
        );
        let tool = tool_with(stub, ToolTimeouts::default());

        let call = tokio::spawn(async move {
            tool.flat_playlist("https://www.youtube.com/playlist?list=PLslow")
                .await
        });
        let pid = fake::wait_for_pid(&pid_file).await;
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());

        fake::wait_until_exited(pid).await;
    }

    #[test]
    fn watch_url_prefers_absolute_entry_url() {
        let entry = FlatEntry {
            id: Some("abc".into()),
            url: Some("https://youtu.be/abc".into()),
            ..FlatEntry::default()
        };
        assert_eq!(entry.watch_url().as_deref(), Some("https://youtu.be/abc"));

        let bare = FlatEntry::default();
        assert!(bare.watch_url().is_none());
        assert!(bare.best_thumbnail().is_none());
    }

    #[test]
    fn ensure_program_available_rejects_missing_binary() {
        let err = ensure_program_available(Path::new("/nonexistent/ffmpeg"), "-version")
            .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}

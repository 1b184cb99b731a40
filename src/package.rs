#![forbid(unsafe_code)]

//! Turns the files a job produced into an HTTP response.
//!
//! A single file is streamed straight from disk. Several files are zipped on a
//! blocking worker that writes into a bounded in-memory pipe read by the
//! response body, so the archive never exists as a whole anywhere. In both
//! cases the [`JobWorkspace`] travels with the body and the job directory is
//! deleted once the body is finished or dropped.

use std::{
    fmt::Write as _,
    io::{self, Write},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::Stream;
use mime_guess::MimeGuess;
use tokio::fs::File;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{
    error::{PlaylistError, PlaylistResult},
    workspace::JobWorkspace,
};

pub const ARCHIVE_NAME: &str = "playlist.zip";
pub const DEFAULT_MEDIA_TYPE: &str = "video/mp4";
const ZIP_PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    Single(PathBuf),
    Archive(Vec<PathBuf>),
}

/// Exactly one file is sent as-is; anything more becomes a zip.
pub fn plan_package(mut files: Vec<PathBuf>) -> PlaylistResult<Package> {
    match files.len() {
        0 => Err(PlaylistError::packaging("No files downloaded")),
        1 => Ok(Package::Single(files.remove(0))),
        _ => Ok(Package::Archive(files)),
    }
}

/// Builds the response for `package`. Ownership of `workspace` moves into the
/// response body.
pub async fn package_response(
    workspace: JobWorkspace,
    package: Package,
) -> PlaylistResult<Response> {
    match package {
        Package::Single(path) => file_response(workspace, &path).await,
        Package::Archive(files) => Ok(zip_response(workspace, files)),
    }
}

async fn file_response(workspace: JobWorkspace, path: &Path) -> PlaylistResult<Response> {
    let file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let mime = MimeGuess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_MEDIA_TYPE);
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    tracing::info!(job = %workspace.id(), file = %name, bytes = size, "sending single file");
    let body = Body::from_stream(WithWorkspace {
        inner: ReaderStream::new(file),
        _workspace: workspace,
    });

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(header::CONTENT_DISPOSITION, attachment_disposition(&name));
    Ok(response)
}

fn zip_response(workspace: JobWorkspace, files: Vec<PathBuf>) -> Response {
    let (reader, writer) = tokio::io::duplex(ZIP_PIPE_CAPACITY);
    let mut sink = SyncIoBridge::new(writer);

    tokio::task::spawn_blocking(move || {
        let job = workspace.id();
        match write_archive(&files, &mut sink) {
            Ok(entries) => tracing::info!(job = %job, entries, "archive streamed"),
            Err(err) => tracing::warn!(job = %job, error = %err, "archive stream aborted"),
        }
        // Files go before the pipe closes, so a client that saw the end of the
        // archive never observes leftovers.
        workspace.close();
        drop(sink);
    });

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=playlist.zip"),
    );
    response
}

/// Writes every file as one entry named after the file. Stops at the first
/// write error, which is how a disconnected client shows up here.
fn write_archive<W: Write>(files: &[PathBuf], sink: W) -> zip::result::ZipResult<usize> {
    let mut zip = ZipWriter::new_stream(sink);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for path in files {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file without a name"))?;
        tracing::debug!(entry = %name, "adding archive entry");
        zip.start_file(name, options)?;
        let mut file = std::fs::File::open(path)?;
        io::copy(&mut file, &mut zip)?;
    }

    let mut inner = zip.finish()?;
    inner.flush()?;
    Ok(files.len())
}

/// `Content-Disposition` carrying an ASCII fallback plus the exact UTF-8 name.
fn attachment_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }

    HeaderValue::from_str(&format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Keeps the job directory alive exactly as long as the body stream.
struct WithWorkspace<S> {
    inner: S,
    _workspace: JobWorkspace,
}

impl<S: Stream + Unpin> Stream for WithWorkspace<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#![forbid(unsafe_code)]

//! Per-request scratch directories.
//!
//! Every download job gets a fresh directory under the download root, named
//! after an opaque job id. The directory (and whatever is left in it) is removed
//! when the [`JobWorkspace`] is dropped, which happens after the response body
//! has been fully streamed, after an error, or when the client goes away.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::PlaylistResult;

/// Leftovers of interrupted downloads; never handed to clients.
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "tmp"];

pub struct JobWorkspace {
    id: Uuid,
    dir: Option<TempDir>,
    path: PathBuf,
}

impl JobWorkspace {
    pub fn create(root: &Path) -> PlaylistResult<Self> {
        let id = Uuid::new_v4();
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", id.simple()))
            .tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        tracing::debug!(job = %id, path = %path.display(), "created job directory");
        Ok(Self {
            id,
            dir: Some(dir),
            path,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finished files directly inside the job directory, ordered by name.
    pub fn collect_files(&self) -> PlaylistResult<Vec<PathBuf>> {
        finished_files(&self.path)
    }

    /// Removes the directory now instead of waiting for the drop.
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => {
                tracing::debug!(job = %self.id, path = %self.path.display(), "removed job directory")
            }
            Err(err) => tracing::warn!(
                job = %self.id,
                path = %self.path.display(),
                error = %err,
                "failed to remove job directory"
            ),
        }
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for JobWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobWorkspace")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

/// Regular files directly inside `dir`, ordered by name, without partial
/// downloads.
pub fn finished_files(dir: &Path) -> PlaylistResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || is_partial(entry.path()) {
            continue;
        }
        files.push(entry.into_path());
    }
    Ok(files)
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PARTIAL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

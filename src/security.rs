#![forbid(unsafe_code)]

//! Startup checks for the bundler service.

use std::{
    fs::{self, DirBuilder},
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::Path,
};

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;

/// Job directories hold third-party media; only the service user may list them.
pub const DOWNLOAD_ROOT_MODE: u32 = 0o700;

/// Fails fast when a binary is started as root. The service spawns external
/// downloaders on attacker-chosen URLs and must not do so with full privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Creates the download root if needed and restricts it to the current user.
pub fn prepare_download_root(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            bail!("download root {} is not a directory", path.display());
        }
    } else {
        DirBuilder::new()
            .recursive(true)
            .mode(DOWNLOAD_ROOT_MODE)
            .create(path)
            .with_context(|| format!("creating download root {}", path.display()))?;
    }

    let mut perms = fs::metadata(path)
        .with_context(|| format!("reading {}", path.display()))?
        .permissions();
    if perms.mode() & 0o777 != DOWNLOAD_ROOT_MODE {
        perms.set_mode(DOWNLOAD_ROOT_MODE);
        fs::set_permissions(path, perms)
            .with_context(|| format!("restricting permissions on {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;
    use tempfile::tempdir;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn prepare_download_root_creates_private_directory() {
        let base = tempdir().unwrap();
        let root = base.path().join("nested").join("downloads");
        prepare_download_root(&root).unwrap();
        let mode = fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DOWNLOAD_ROOT_MODE);
    }

    #[test]
    fn prepare_download_root_tightens_existing_directory() {
        let base = tempdir().unwrap();
        let root = base.path().join("downloads");
        fs::create_dir(&root).unwrap();
        fs::set_permissions(&root, fs::Permissions::from_mode(0o755)).unwrap();
        prepare_download_root(&root).unwrap();
        let mode = fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DOWNLOAD_ROOT_MODE);
    }

    #[test]
    fn prepare_download_root_rejects_files() {
        let base = tempdir().unwrap();
        let file = base.path().join("downloads");
        fs::write(&file, b"not a dir").unwrap();
        let err = prepare_download_root(&file).unwrap_err();
        assert!(err.to_string().contains("is not a directory"));
    }
}

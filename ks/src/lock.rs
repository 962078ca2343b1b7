//! Exclusive repository lock

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use fs2::FileExt;
use tracing::debug;

/// Advisory lock held on `<repo>/kiln.lock` for the lifetime of the value
///
/// Only one daemon (or local build) may own a repository's cache at a time.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    /// Try to take the lock without blocking
    pub fn acquire(repo_dir: impl AsRef<Path>) -> Result<Self> {
        let repo_dir = repo_dir.as_ref();
        fs::create_dir_all(repo_dir).context("Failed to create repository directory")?;
        let path = repo_dir.join("kiln.lock");
        debug!(?path, "RepoLock::acquire: called");

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .context("Failed to open repository lock file")?;

        file.try_lock_exclusive()
            .with_context(|| format!("Repository {} is in use by another kiln process", repo_dir.display()))?;

        debug!(?path, "RepoLock::acquire: lock held");
        Ok(Self { file, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        debug!(path = ?self.path, "RepoLock::drop: releasing");
        let _ = FileExt::unlock(&self.file);
    }
}

//! On-disk layout of a project's build repository
//!
//! ```text
//! <project>/.kiln/
//!   cache.db        incremental cache (sqlite)
//!   kiln.lock       exclusive owner lock
//!   objects/<hash>  per-invocation destination directories
//!   outputs/<name>  symlinks to the objects of built targets
//!   shared/<name>   directories shared across invocations
//!   runs/<id>       persisted run events
//!   daemon.sock     daemon socket
//!   daemon.pid      daemon pid file
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Repo {
    project_dir: PathBuf,
    root: PathBuf,
}

impl Repo {
    /// Open (creating if needed) the repository under `project_dir/repo_dir`
    pub fn open(project_dir: impl AsRef<Path>, repo_dir: &str) -> Result<Self> {
        let project_dir = project_dir.as_ref();
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Project directory {} not found", project_dir.display()))?;
        let root = project_dir.join(repo_dir);
        debug!(?root, "Repo::open: called");

        let repo = Self { project_dir, root };
        for dir in [repo.objects_dir(), repo.outputs_dir(), repo.shared_dir(), repo.runs_dir()] {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(repo)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join("cache.db")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    /// Destination directory for an object id hash
    pub fn object_dir(&self, object_id_hash: &str) -> PathBuf {
        self.objects_dir().join(object_id_hash)
    }

    /// Point `outputs/<name>` at the object directory of `object_id_hash`
    #[cfg(unix)]
    pub fn link_output(&self, name: &str, object_id_hash: &str) -> Result<PathBuf> {
        let link = self.outputs_dir().join(name.replace(['/', '\\'], "_"));
        let target = self.object_dir(object_id_hash);
        debug!(?link, ?target, "Repo::link_output: called");

        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link).with_context(|| format!("Failed to replace {}", link.display()))?;
        }
        std::os::unix::fs::symlink(&target, &link).with_context(|| format!("Failed to link {}", link.display()))?;
        Ok(link)
    }
}

//! Daemon process management
//!
//! One daemon per project. Its PID and version files live in the project's
//! repository directory next to the socket.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::engine::VERSION;
use crate::repo::Repo;

/// How long `stop` waits after SIGTERM before SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    /// Path to the PID file
    pid_file: PathBuf,
    /// Path to the version file
    version_file: PathBuf,
}

impl DaemonManager {
    /// Manager for the daemon of `repo`
    pub fn for_repo(repo: &Repo) -> Self {
        debug!(root = ?repo.root(), "DaemonManager::for_repo: called");
        Self::with_pid_file(repo.pid_path())
    }

    /// Create a daemon manager with a custom PID file path
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        let version_file = pid_file.with_extension("version");
        Self { pid_file, version_file }
    }

    /// Check if a daemon is running
    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_running)
    }

    /// Get the running daemon's PID
    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        read_trimmed(&self.pid_file)?.parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.pid_file, "DaemonManager::write_pid: called");
        write_file(&self.pid_file, &pid.to_string())
    }

    /// Version written by the running daemon
    pub fn read_version(&self) -> Option<String> {
        read_trimmed(&self.version_file)
    }

    /// Whether the running daemon was built from the same version as this CLI
    pub fn version_matches(&self) -> bool {
        match self.read_version() {
            Some(daemon_version) => {
                let matches = daemon_version == VERSION;
                debug!(daemon_version, cli_version = VERSION, matches, "DaemonManager::version_matches: checked");
                matches
            }
            None => false,
        }
    }

    /// Start a background daemon for `project_dir`
    ///
    /// Spawns `kd run-daemon` detached from this terminal and returns its PID.
    pub fn start(&self, project_dir: &Path, config_path: Option<&Path>) -> Result<u32> {
        debug!(?project_dir, "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        info!("Starting daemon...");
        let exe = std::env::current_exe().context("Failed to get current executable")?;

        let mut command = Command::new(&exe);
        command.arg("--project").arg(project_dir);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        let child = command
            .arg("run-daemon")
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;

        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Stop the daemon with SIGTERM, escalating to SIGKILL
    pub fn stop(&self) -> Result<()> {
        debug!("DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon...");
        send_signal(pid, Signal::SIGTERM).context("Failed to send SIGTERM")?;

        if !wait_for_exit(pid, STOP_GRACE) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = send_signal(pid, Signal::SIGKILL);
        }

        self.cleanup()?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Register the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        write_file(&self.version_file, VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Remove the PID and version files
    pub fn cleanup(&self) -> Result<()> {
        remove_if_exists(&self.pid_file)?;
        remove_if_exists(&self.version_file)
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        debug!("DaemonManager::status: called");
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
            version: pid.and_then(|_| self.read_version()),
        }
    }
}

/// Whether a process with `pid` exists
fn is_process_running(pid: u32) -> bool {
    // No signal: existence check only
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    kill(Pid::from_raw(pid as i32), signal)
}

/// Poll until `pid` exits or `grace` elapses; true if it exited
fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while is_process_running(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    true
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(?path, "Removed daemon file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    /// Version reported by the running daemon
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_for_repo_uses_repo_pid_path() {
        let temp = TempDir::new().unwrap();
        let repo = Repo::open(temp.path(), ".kiln").unwrap();
        let manager = DaemonManager::for_repo(&repo);
        assert_eq!(manager.pid_file(), &repo.pid_path());
        assert_eq!(manager.version_file, repo.root().join("daemon.version"));
    }

    #[test]
    fn test_is_not_running_when_no_pid_file() {
        let temp = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp.path().join("nonexistent.pid"));
        assert!(!manager.is_running());
        assert!(manager.stop().is_err());
    }

    #[test]
    fn test_write_and_read_pid() {
        let temp = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp.path().join("test.pid"));

        manager.write_pid(12345).unwrap();
        assert_eq!(manager.read_pid(), Some(12345));

        manager.cleanup().unwrap();
        assert_eq!(manager.read_pid(), None);
        // Removing again is not an error
        manager.cleanup().unwrap();
    }

    #[test]
    fn test_register_self_reports_running() {
        let temp = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp.path().join("daemon.pid"));

        manager.register_self().unwrap();
        let status = manager.status();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));
        assert_eq!(status.version.as_deref(), Some(VERSION));
        assert!(manager.version_matches());

        manager.cleanup().unwrap();
        assert!(!manager.status().running);
        assert!(!manager.version_matches());
    }

    #[test]
    fn test_version_mismatch() {
        let temp = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp.path().join("daemon.pid"));
        write_file(&manager.version_file, "0.0.0-other").unwrap();
        assert!(!manager.version_matches());
    }
}

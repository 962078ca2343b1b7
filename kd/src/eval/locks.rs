//! Named directory locks for `WithDirectoryLock`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

#[derive(Default)]
pub struct DirectoryLocker {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl DirectoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding `directory`; one per distinct path
    pub fn lock_for(&self, directory: &Path) -> Arc<AsyncMutex<()>> {
        debug!(?directory, "DirectoryLocker::lock_for: called");
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(directory.to_path_buf()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_directory_shares_lock() {
        let locker = DirectoryLocker::new();
        let a = locker.lock_for(Path::new("/shared/maven"));
        let b = locker.lock_for(Path::new("/shared/maven"));
        let c = locker.lock_for(Path::new("/shared/other"));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(c.try_lock().is_ok());
    }
}

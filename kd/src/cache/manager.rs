//! CacheManager - actor that owns the record store
//!
//! All reads and writes go through one task, so operations on a key are
//! linearizable without a lock around the store.

use std::path::Path;

use kilnstore::{CacheRecord, Store};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{CacheCommand, CacheError, CacheResponse};

/// Handle to send commands to the CacheManager
#[derive(Clone)]
pub struct CacheManager {
    tx: mpsc::Sender<CacheCommand>,
}

impl CacheManager {
    /// Spawn the actor over the store at `path`
    pub fn spawn(path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(path = %path.as_ref().display(), "CacheManager::spawn: called");
        let store = Store::open(path)?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn over an in-memory store (for testing)
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        Ok(Self::spawn_with_store(Store::open_in_memory()?))
    }

    fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("CacheManager spawned");
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<CacheResponse<T>>) -> CacheCommand,
    ) -> CacheResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| CacheError::Channel)?;
        reply_rx.await.map_err(|_| CacheError::Channel)?
    }

    /// Record for `key`; any failure reads as a miss
    pub async fn lookup(&self, key: &str) -> Option<CacheRecord> {
        debug!(%key, "CacheManager::lookup: called");
        let key = key.to_string();
        match self.request(|reply| CacheCommand::Lookup { key, reply }).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "CacheManager::lookup: treating as miss");
                None
            }
        }
    }

    pub async fn commit(&self, record: CacheRecord) -> CacheResponse<()> {
        debug!(key = %record.object_id_hash, rule = %record.rule_name, "CacheManager::commit: called");
        self.request(|reply| CacheCommand::Commit {
            record: Box::new(record),
            reply,
        })
        .await
    }

    /// Drop the record for `key`; true if one existed
    pub async fn invalidate(&self, key: &str) -> CacheResponse<bool> {
        debug!(%key, "CacheManager::invalidate: called");
        let key = key.to_string();
        self.request(|reply| CacheCommand::Invalidate { key, reply }).await
    }

    pub async fn count(&self) -> CacheResponse<u64> {
        self.request(|reply| CacheCommand::Count { reply }).await
    }
}

fn store_error(e: eyre::Report) -> CacheError {
    CacheError::Store(format!("{:#}", e))
}

async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<CacheCommand>) {
    debug!("actor_loop: CacheManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            CacheCommand::Lookup { key, reply } => {
                debug!(%key, "actor_loop: Lookup command");
                let _ = reply.send(store.get(&key).map_err(store_error));
            }
            CacheCommand::Commit { record, reply } => {
                debug!(key = %record.object_id_hash, "actor_loop: Commit command");
                let _ = reply.send(store.put(&record).map_err(store_error));
            }
            CacheCommand::Invalidate { key, reply } => {
                debug!(%key, "actor_loop: Invalidate command");
                let _ = reply.send(store.remove(&key).map_err(store_error));
            }
            CacheCommand::Count { reply } => {
                let _ = reply.send(store.count().map_err(store_error));
            }
        }
    }

    debug!("actor_loop: channel closed, CacheManager stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn record(key: &str) -> CacheRecord {
        CacheRecord::new(key, "jvm.compile", "fp", PathBuf::from("/objects").join(key), vec![1, 2, 3])
    }

    #[tokio::test]
    async fn test_commit_then_lookup() {
        let cache = CacheManager::spawn_in_memory().unwrap();
        assert!(cache.lookup("k1").await.is_none());

        cache.commit(record("k1")).await.unwrap();
        let found = cache.lookup("k1").await.unwrap();
        assert_eq!(found.rule_name, "jvm.compile");
        assert_eq!(cache.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = CacheManager::spawn_in_memory().unwrap();
        cache.commit(record("a")).await.unwrap();
        cache.commit(record("b")).await.unwrap();

        assert!(cache.invalidate("a").await.unwrap());
        assert!(!cache.invalidate("a").await.unwrap());
        assert!(cache.lookup("a").await.is_none());
        assert_eq!(cache.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_spawns() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.db");
        {
            let cache = CacheManager::spawn(&path).unwrap();
            cache.commit(record("k")).await.unwrap();
        }
        // Let the first actor observe the closed channel and drop its connection
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let cache = CacheManager::spawn(&path).unwrap();
        assert!(cache.lookup("k").await.is_some());
    }
}

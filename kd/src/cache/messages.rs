//! Cache manager messages

use kilnstore::CacheRecord;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from cache operations
///
/// Never surfaced to rules: lookups degrade to a miss, failed commits are logged.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Channel error")]
    Channel,
}

pub type CacheResponse<T> = Result<T, CacheError>;

/// Commands sent to the CacheManager actor
#[derive(Debug)]
pub enum CacheCommand {
    Lookup {
        key: String,
        reply: oneshot::Sender<CacheResponse<Option<CacheRecord>>>,
    },
    Commit {
        record: Box<CacheRecord>,
        reply: oneshot::Sender<CacheResponse<()>>,
    },
    Invalidate {
        key: String,
        reply: oneshot::Sender<CacheResponse<bool>>,
    },
    Count {
        reply: oneshot::Sender<CacheResponse<u64>>,
    },
}

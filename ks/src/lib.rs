//! KilnStore - persistent records for the kiln incremental cache
//!
//! One SQLite table keyed by object id hash. The schema version lives in
//! `PRAGMA user_version`; an incompatible or unreadable database is set aside
//! and recreated empty, so every failure mode degrades to a cache miss.

mod lock;
mod record;
mod store;

pub use lock::RepoLock;
pub use record::{CacheRecord, now_ms};
pub use store::{SCHEMA_VERSION, Store};

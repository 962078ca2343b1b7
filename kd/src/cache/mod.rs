//! Incremental cache
//!
//! [`CacheManager`] serializes access to the persistent record store,
//! [`InFlight`] coalesces concurrent executions of the same key, and
//! [`fingerprint`] computes keys and input fingerprints.

pub mod fingerprint;
mod inflight;
mod manager;
mod messages;

pub use fingerprint::{ENGINE_VERSION, input_fingerprint, object_id_hash};
pub use inflight::{Claim, Follower, InFlight, LeaderGuard, Outcome};
pub use manager::CacheManager;
pub use messages::{CacheCommand, CacheError, CacheResponse};

//! Cache record type

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Last successful evaluation of one rule invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Cache key: fingerprint of rule identity, arguments and rule version
    pub object_id_hash: String,

    /// Fully qualified rule name, kept for inspection
    pub rule_name: String,

    /// Fingerprint of the argument values plus referenced file contents
    pub input_fingerprint: String,

    /// Destination directory the invocation wrote into
    pub dest_directory: PathBuf,

    /// Canonical bytes of the produced value
    pub value: Vec<u8>,

    /// Files and directories under `dest_directory` named by the value
    pub outputs: Vec<PathBuf>,

    /// Commit time (ms since epoch)
    pub committed_at: i64,
}

impl CacheRecord {
    /// Create a record stamped with the current time
    pub fn new(
        object_id_hash: impl Into<String>,
        rule_name: impl Into<String>,
        input_fingerprint: impl Into<String>,
        dest_directory: impl Into<PathBuf>,
        value: Vec<u8>,
    ) -> Self {
        Self {
            object_id_hash: object_id_hash.into(),
            rule_name: rule_name.into(),
            input_fingerprint: input_fingerprint.into(),
            dest_directory: dest_directory.into(),
            value,
            outputs: Vec::new(),
            committed_at: now_ms(),
        }
    }

    /// Attach output paths
    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }
}

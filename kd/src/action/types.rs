//! Results returned to blocking callers

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Outcome of a successful BuildTarget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltTargetInfo {
    pub run_id: String,
    pub target: String,
    pub object_id_hash: String,
    pub value: Value,
    /// Object directory holding the target's outputs
    pub output_dir: PathBuf,
}

/// Outcome of a successful InvokeAction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub run_id: String,
    pub action: String,
    /// Absent when the action completed without a value
    #[serde(default)]
    pub value: Option<Value>,
}

//! Per-invocation context handed to a rule body

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::error::BuildError;
use crate::eval::CancelToken;
use crate::events::ProgressLogger;
use crate::value::{Args, Record, Value, ValueSet};

/// Everything a rule may know about its invocation
///
/// Cheap to clone; continuations capture a clone to keep using the
/// destination directory and logger after an `EvalAndThen`.
#[derive(Clone)]
pub struct Context {
    rule_name: String,
    arguments: Arc<Args>,
    dest_directory: PathBuf,
    object_id_hash: String,
    hash_changed: bool,
    prev_result: Option<Arc<Value>>,
    prev_build_time: Option<DateTime<Utc>>,
    shared_root: PathBuf,
    progress: ProgressLogger,
    cancel: CancelToken,
}

impl Context {
    /// Context with no cache history and a detached logger
    pub fn new(rule_name: impl Into<String>, arguments: Args, dest_directory: impl Into<PathBuf>) -> Self {
        let rule_name = rule_name.into();
        let dest_directory = dest_directory.into();
        let shared_root = dest_directory.join("shared");
        Self {
            progress: ProgressLogger::detached(&rule_name),
            rule_name,
            arguments: Arc::new(arguments),
            dest_directory,
            object_id_hash: String::new(),
            hash_changed: true,
            prev_result: None,
            prev_build_time: None,
            shared_root,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_object_id_hash(mut self, hash: impl Into<String>) -> Self {
        self.object_id_hash = hash.into();
        self
    }

    pub fn with_hash_changed(mut self, changed: bool) -> Self {
        self.hash_changed = changed;
        self
    }

    /// Result and time of the last successful build under the same key
    pub fn with_previous(mut self, result: Value, built_at: DateTime<Utc>) -> Self {
        self.prev_result = Some(Arc::new(result));
        self.prev_build_time = Some(built_at);
        self
    }

    pub fn with_shared_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.shared_root = root.into();
        self
    }

    pub fn with_progress(mut self, progress: ProgressLogger) -> Self {
        self.progress = progress;
        self
    }

    /// Token of the run this evaluation belongs to
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    pub fn arguments(&self) -> &Args {
        &self.arguments
    }

    /// Private output directory, unique per object id hash
    pub fn dest_directory(&self) -> &Path {
        &self.dest_directory
    }

    pub fn object_id_hash(&self) -> &str {
        &self.object_id_hash
    }

    /// False only when the same key was built before and the inputs are unchanged
    pub fn hash_changed(&self) -> bool {
        self.hash_changed
    }

    pub fn prev_result(&self) -> Option<&Value> {
        self.prev_result.as_deref()
    }

    pub fn prev_build_time(&self) -> Option<DateTime<Utc>> {
        self.prev_build_time
    }

    pub fn progress(&self) -> &ProgressLogger {
        &self.progress
    }

    /// Fires when the owning run is cancelled; long subprocesses select on it
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Named directory shared by every invocation in the repository
    ///
    /// Created on demand; writers should serialize through
    /// [`super::RuleResult::WithDirectoryLock`].
    pub fn shared_directory(&self, name: &str) -> Result<PathBuf, BuildError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(self.arg_error(format!("invalid shared directory name '{}'", name)));
        }
        let dir = self.shared_root.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::from(e).attribute(&self.rule_name))?;
        Ok(dir)
    }

    /// Declared argument by name
    pub fn arg(&self, name: &str) -> Result<&Value, BuildError> {
        self.arguments
            .get(name)
            .ok_or_else(|| self.arg_error(format!("missing argument '{}'", name)))
    }

    /// Argument that may be absent or `None`
    pub fn optional_arg(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name).filter(|v| !v.is_none())
    }

    pub fn string_arg(&self, name: &str) -> Result<&str, BuildError> {
        let value = self.arg(name)?;
        value.as_str().ok_or_else(|| self.type_error(name, "string", value))
    }

    pub fn bool_arg(&self, name: &str) -> Result<bool, BuildError> {
        let value = self.arg(name)?;
        value.as_bool().ok_or_else(|| self.type_error(name, "bool", value))
    }

    pub fn number_arg(&self, name: &str) -> Result<i64, BuildError> {
        let value = self.arg(name)?;
        value.as_number().ok_or_else(|| self.type_error(name, "number", value))
    }

    /// Any of path, file or directory
    pub fn path_arg(&self, name: &str) -> Result<&Path, BuildError> {
        let value = self.arg(name)?;
        value.as_path().ok_or_else(|| self.type_error(name, "path", value))
    }

    pub fn file_arg(&self, name: &str) -> Result<&Path, BuildError> {
        let value = self.arg(name)?;
        value.as_file().ok_or_else(|| self.type_error(name, "file", value))
    }

    pub fn directory_arg(&self, name: &str) -> Result<&Path, BuildError> {
        let value = self.arg(name)?;
        value.as_directory().ok_or_else(|| self.type_error(name, "directory", value))
    }

    pub fn list_arg(&self, name: &str) -> Result<&[Value], BuildError> {
        let value = self.arg(name)?;
        value.as_list().ok_or_else(|| self.type_error(name, "list", value))
    }

    pub fn set_arg(&self, name: &str) -> Result<&ValueSet, BuildError> {
        let value = self.arg(name)?;
        value.as_set().ok_or_else(|| self.type_error(name, "set", value))
    }

    pub fn record_arg(&self, name: &str, type_name: &str) -> Result<&Record, BuildError> {
        let value = self.arg(name)?;
        value.as_record_of(type_name).ok_or_else(|| self.type_error(name, type_name, value))
    }

    /// Argument error attributed to this rule
    pub fn arg_error(&self, message: impl Into<String>) -> BuildError {
        BuildError::argument(message).attribute(&self.rule_name)
    }

    /// Execution error attributed to this rule
    pub fn fail(&self, message: impl Into<String>) -> BuildError {
        BuildError::execution(message).attribute(&self.rule_name)
    }

    fn type_error(&self, name: &str, expected: &str, got: &Value) -> BuildError {
        self.arg_error(format!("argument '{}' must be {}, got {}", name, expected, got.kind()))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("rule_name", &self.rule_name)
            .field("object_id_hash", &self.object_id_hash)
            .field("hash_changed", &self.hash_changed)
            .field("dest_directory", &self.dest_directory)
            .finish_non_exhaustive()
    }
}

//! What a rule body hands back to the evaluator

use std::fmt;
use std::path::PathBuf;

use super::error::BuildError;
use crate::value::{Args, Value};

/// Continuation run with the value of a requested evaluation
pub type Continuation = Box<dyn FnOnce(Value) -> Result<RuleResult, BuildError> + Send>;

/// Block run while holding a directory lock
pub type LockedBlock = Box<dyn FnOnce() -> Result<RuleResult, BuildError> + Send>;

/// Outcome of one step of a rule
///
/// Rules never call each other directly: to use another rule's output they
/// return [`RuleResult::EvalAndThen`] and the evaluator resumes them with the
/// value. Chains of any depth are driven iteratively.
pub enum RuleResult {
    /// Final value of the rule
    Value(Value),
    /// Completed with no value; only valid for actions
    Done,
    Failed(BuildError),
    /// Evaluate `rule` with `args`, then continue with its value
    ///
    /// If that evaluation fails, `then` is never invoked and the failure
    /// propagates as a nested evaluation error.
    EvalAndThen {
        rule: String,
        args: Args,
        then: Continuation,
    },
    /// Run `then` while holding an exclusive lock on `directory`
    WithDirectoryLock { directory: PathBuf, then: LockedBlock },
}

impl RuleResult {
    pub fn value(value: impl Into<Value>) -> Self {
        RuleResult::Value(value.into())
    }

    pub fn failed(error: BuildError) -> Self {
        RuleResult::Failed(error)
    }

    pub fn eval_and_then<F>(rule: impl Into<String>, args: Args, then: F) -> Self
    where
        F: FnOnce(Value) -> Result<RuleResult, BuildError> + Send + 'static,
    {
        RuleResult::EvalAndThen {
            rule: rule.into(),
            args,
            then: Box::new(then),
        }
    }

    /// Evaluate `rule` and return its value unchanged
    pub fn eval(rule: impl Into<String>, args: Args) -> Self {
        Self::eval_and_then(rule, args, |value| Ok(RuleResult::Value(value)))
    }

    pub fn with_directory_lock<F>(directory: impl Into<PathBuf>, then: F) -> Self
    where
        F: FnOnce() -> Result<RuleResult, BuildError> + Send + 'static,
    {
        RuleResult::WithDirectoryLock {
            directory: directory.into(),
            then: Box::new(then),
        }
    }
}

impl From<Value> for RuleResult {
    fn from(value: Value) -> Self {
        RuleResult::Value(value)
    }
}

impl fmt::Debug for RuleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleResult::Value(value) => f.debug_tuple("Value").field(value).finish(),
            RuleResult::Done => f.write_str("Done"),
            RuleResult::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            RuleResult::EvalAndThen { rule, args, .. } => f
                .debug_struct("EvalAndThen")
                .field("rule", rule)
                .field("args", &args.keys().collect::<Vec<_>>())
                .finish_non_exhaustive(),
            RuleResult::WithDirectoryLock { directory, .. } => f
                .debug_struct("WithDirectoryLock")
                .field("directory", directory)
                .finish_non_exhaustive(),
        }
    }
}

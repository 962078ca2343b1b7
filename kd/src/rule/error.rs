//! Build error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while evaluating rules
///
/// Cloneable so that callers coalesced onto one execution all receive the
/// same failure. Cause chains are kept as rendered strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// Missing or malformed declared argument
    #[error("argument error in {rule}: {message}")]
    Argument { rule: String, message: String },

    /// The rule's own logic failed
    #[error("rule {rule} failed: {message}")]
    RuleExecution {
        rule: String,
        message: String,
        causes: Vec<String>,
    },

    /// A transitively invoked rule failed
    ///
    /// `path` lists the enclosing rules innermost first; `source` is the
    /// original failure, never itself a `NestedEvaluation`.
    #[error("evaluation of {} failed: {source}", display_path(path))]
    NestedEvaluation { path: Vec<String>, source: Box<BuildError> },

    #[error("unknown rule: {0}")]
    UnknownRule(String),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("evaluation cancelled")]
    Cancelled,
}

fn display_path(path: &[String]) -> String {
    path.iter().rev().map(String::as_str).collect::<Vec<_>>().join(" -> ")
}

impl BuildError {
    /// Argument error not yet attributed to a rule
    pub fn argument(message: impl Into<String>) -> Self {
        BuildError::Argument {
            rule: String::new(),
            message: message.into(),
        }
    }

    /// Execution error not yet attributed to a rule
    pub fn execution(message: impl Into<String>) -> Self {
        BuildError::RuleExecution {
            rule: String::new(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Execution error built from any error and its source chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut next = err.source();
        while let Some(cause) = next {
            causes.push(cause.to_string());
            next = cause.source();
        }
        BuildError::RuleExecution {
            rule: String::new(),
            message: err.to_string(),
            causes,
        }
    }

    /// Fill in the rule name on errors raised without one
    pub fn attribute(mut self, rule_name: &str) -> Self {
        match &mut self {
            BuildError::Argument { rule, .. } | BuildError::RuleExecution { rule, .. } if rule.is_empty() => {
                *rule = rule_name.to_string();
            }
            _ => {}
        }
        self
    }

    /// Wrap as the failure of a nested evaluation requested by `enclosing`
    ///
    /// Repeated wrapping extends the path instead of nesting boxes.
    pub fn nested(self, enclosing: &str) -> Self {
        match self {
            BuildError::Cancelled => BuildError::Cancelled,
            BuildError::NestedEvaluation { mut path, source } => {
                path.push(enclosing.to_string());
                BuildError::NestedEvaluation { path, source }
            }
            other => BuildError::NestedEvaluation {
                path: vec![enclosing.to_string()],
                source: Box::new(other),
            },
        }
    }

    /// The original failure beneath any nesting
    pub fn root(&self) -> &BuildError {
        match self {
            BuildError::NestedEvaluation { source, .. } => source,
            other => other,
        }
    }

    /// Taxonomy name used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Argument { .. } => "ArgumentError",
            BuildError::RuleExecution { .. } => "RuleExecutionError",
            BuildError::NestedEvaluation { .. } => "NestedEvaluationError",
            BuildError::UnknownRule(_) => "UnknownRule",
            BuildError::Cycle(_) => "CycleError",
            BuildError::Cancelled => "Cancelled",
        }
    }

    /// Human-readable cause chain, outermost first, excluding `self`
    pub fn causes(&self) -> Vec<String> {
        match self {
            BuildError::NestedEvaluation { source, .. } => {
                let mut chain = vec![source.to_string()];
                chain.extend(source.causes());
                chain
            }
            BuildError::RuleExecution { causes, .. } => causes.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::from_error(&err)
    }
}

impl From<eyre::Report> for BuildError {
    fn from(report: eyre::Report) -> Self {
        let mut chain = report.chain().map(|e| e.to_string());
        let message = chain.next().unwrap_or_default();
        BuildError::RuleExecution {
            rule: String::new(),
            message,
            causes: chain.collect(),
        }
    }
}

/// Serializable failure description for responses and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Taxonomy name, e.g. `NestedEvaluationError`
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub causes: Vec<String>,
}

impl ErrorInfo {
    /// Error that did not come from rule evaluation (bad request, unknown run)
    pub fn request(message: impl Into<String>) -> Self {
        Self {
            kind: "RequestError".to_string(),
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl From<&BuildError> for ErrorInfo {
    fn from(err: &BuildError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            causes: err.causes(),
        }
    }
}

impl From<BuildError> for ErrorInfo {
    fn from(err: BuildError) -> Self {
        ErrorInfo::from(&err)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, "\n  caused by: {}", cause)?;
        }
        Ok(())
    }
}

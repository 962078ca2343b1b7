//! Event types emitted by action and build runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rule::ErrorInfo;
use crate::value::Value;

/// Severity of a progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Verbose,
    Info,
    Error,
}

/// Everything an observer of a run can see
///
/// A run emits exactly one `Started`, then any number of `Progress` and
/// `Output`, then exactly one of `Finished` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionEvent {
    Started {
        run_id: String,
        target: String,
        rule: String,
    },

    /// Log message from a rule
    Progress {
        run_id: String,
        rule: String,
        level: ProgressLevel,
        message: String,
    },

    /// One line of subprocess output
    Output {
        run_id: String,
        rule: String,
        line: String,
        #[serde(default)]
        stderr: bool,
    },

    Finished {
        run_id: String,
        /// Absent for actions that return no value
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        object_id_hash: Option<String>,
    },

    Failed {
        run_id: String,
        error: ErrorInfo,
    },
}

impl ActionEvent {
    /// Run this event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            ActionEvent::Started { run_id, .. }
            | ActionEvent::Progress { run_id, .. }
            | ActionEvent::Output { run_id, .. }
            | ActionEvent::Finished { run_id, .. }
            | ActionEvent::Failed { run_id, .. } => run_id,
        }
    }

    /// Variant name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            ActionEvent::Started { .. } => "Started",
            ActionEvent::Progress { .. } => "Progress",
            ActionEvent::Output { .. } => "Output",
            ActionEvent::Finished { .. } => "Finished",
            ActionEvent::Failed { .. } => "Failed",
        }
    }

    /// Whether no further events follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionEvent::Finished { .. } | ActionEvent::Failed { .. })
    }
}

/// Event with timestamp, one line of a run's JSONL log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: ActionEvent,
}

impl EventLogEntry {
    pub fn new(event: ActionEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

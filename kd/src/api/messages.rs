//! Daemon request and response types
//!
//! JSON-over-newline protocol. Each message is a single line of JSON followed
//! by `\n`. Blocking requests get exactly one response line; streaming
//! requests get one `Event` line per run event, ending with the terminal one.

use serde::{Deserialize, Serialize};

use crate::action::{ActionResult, BuiltTargetInfo};
use crate::engine::RepoInfo;
use crate::events::ActionEvent;
use crate::rule::ErrorInfo;
use crate::value::Args;

/// Requests from CLI to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Project metadata, no evaluation
    GetRepoInfo,

    /// Re-read the target graph
    ReloadScript,

    /// Build one target to completion
    BuildTarget { target: String },

    /// Run an action to completion
    InvokeAction {
        action: String,
        #[serde(default)]
        args: Args,
    },

    /// Run an action, streaming its events
    StreamingInvokeAction {
        action: String,
        #[serde(default)]
        args: Args,
        /// Cancel the run when this connection closes before it finishes
        #[serde(default)]
        cancel_on_disconnect: bool,
    },

    /// Stream the events of an existing run from the beginning
    ObserveRun { run_id: String },

    CancelRun { run_id: String },

    /// Ping to check if daemon is alive
    Ping,

    /// Request daemon to stop gracefully
    Shutdown,
}

/// Responses from daemon to CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    RepoInfo { info: RepoInfo },

    BuiltTarget { info: BuiltTargetInfo },

    ActionResult { result: ActionResult },

    /// One event of a streamed run
    Event { event: ActionEvent },

    /// Acknowledgment
    Ok,

    /// Pong response to ping
    Pong { version: String },

    /// Error response
    Error { error: ErrorInfo },
}

impl DaemonResponse {
    pub fn error(error: impl Into<ErrorInfo>) -> Self {
        DaemonResponse::Error { error: error.into() }
    }
}

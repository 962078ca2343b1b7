//! Daemon API
//!
//! Requests map onto [`crate::action::ActionExecutor`]: `GetRepoInfo` and
//! `ReloadScript` answer with project metadata, `BuildTarget` and
//! `InvokeAction` block until the run terminates, and
//! `StreamingInvokeAction` forwards every run event as it happens.

pub mod messages;
mod server;

pub use messages::{DaemonMessage, DaemonResponse};
pub use server::{DaemonServer, handle_connection};

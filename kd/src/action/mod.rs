//! Action execution and streaming
//!
//! A run wraps one evaluator invocation and republishes it as an ordered
//! event sequence: `Started`, any `Progress`/`Output`, then exactly one of
//! `Finished` or `Failed`. Blocking callers collapse the sequence to its
//! terminal event.

mod executor;
mod types;

pub use executor::ActionExecutor;
pub use types::{ActionResult, BuiltTargetInfo};

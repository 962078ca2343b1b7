//! Rules: the unit of work in a build
//!
//! A [`Rule`] receives a [`Context`] and returns a [`RuleResult`]. Rules are
//! looked up by name in a [`RuleRegistry`] and driven by the evaluator.

mod context;
mod error;
mod registry;
mod result;

pub use context::Context;
pub use error::{BuildError, ErrorInfo};
pub use registry::{FnRule, Rule, RuleKind, RuleRegistry, rule_fn};
pub use result::{Continuation, LockedBlock, RuleResult};

//! Rule evaluation
//!
//! [`Evaluator`] drives rule bodies and their continuations with an explicit
//! stack, consulting the incremental cache and coalescing concurrent
//! evaluations of the same key.

mod cancel;
mod engine;
mod locks;

pub use cancel::CancelToken;
pub use engine::{Evaluated, Evaluator};
pub use locks::DirectoryLocker;

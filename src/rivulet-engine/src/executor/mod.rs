//! Execution infrastructure.
//!
//! - [`ExecContext`]: scheduler, memory budget, metrics and registries
//! - [`TaskScheduler`]: where node tasks run
//! - [`Completion`]: one-shot result of a node or a plan
//! - [`LocalExecutor`]: runs a [`Declaration`] to completion in this process
//!
//! [`Declaration`]: crate::plan::Declaration

mod completion;
mod context;
mod local;
mod result;
mod scheduler;

pub use completion::{Completion, CompletionSource};
pub use context::{CancellationHandle, ExecContext};
pub use local::LocalExecutor;
pub use result::ExecutionResult;
pub use scheduler::{TaskScheduler, TokioScheduler};

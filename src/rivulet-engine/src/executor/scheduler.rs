//! Task submission.
//!
//! Nodes never run heavy work on the caller's thread; they wrap it in a
//! future and hand it to the plan's [`TaskScheduler`]. A tokio handle is
//! the default backend, but anything that can drive `'static` futures to
//! completion will do.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use common_error::{RivuletError, RivuletResult};

/// Runs node tasks to completion.
pub trait TaskScheduler: Send + Sync + fmt::Debug {
    /// Submit a task. `name` is for diagnostics only.
    fn submit(&self, name: &str, task: BoxFuture<'static, ()>) -> RivuletResult<()>;
}

/// Scheduler backed by a tokio runtime handle.
#[derive(Debug)]
pub struct TokioScheduler {
    handle: Handle,
    submitted: AtomicU64,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            submitted: AtomicU64::new(0),
        }
    }

    /// Scheduler on the runtime the caller is running in.
    pub fn current() -> RivuletResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| RivuletError::invalid_state(format!("no tokio runtime: {e}")))
    }

    /// Tasks submitted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

impl TaskScheduler for TokioScheduler {
    fn submit(&self, name: &str, task: BoxFuture<'static, ()>) -> RivuletResult<()> {
        let n = self.submitted.fetch_add(1, Ordering::Relaxed);
        log::trace!("submitting task {n} ({name})");
        self.handle.spawn(task);
        Ok(())
    }
}

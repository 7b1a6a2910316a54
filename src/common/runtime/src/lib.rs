//! Async runtime utilities for Rivulet.
//!
//! Provides the worker pool that executes node tasks and a few helpers for
//! driving futures from synchronous code.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use common_error::{RivuletError, RivuletResult};
use tokio::runtime::{Builder, Handle, Runtime};

/// Get a fresh multi-threaded Tokio runtime for blocking operations.
pub fn get_runtime() -> RivuletResult<Runtime> {
    Runtime::new()
        .map_err(|e| RivuletError::InternalError(format!("Failed to create runtime: {e}")))
}

/// Block on a future using a fresh runtime.
///
/// Must not be called from inside another runtime.
pub fn block_on<F: Future>(future: F) -> RivuletResult<F::Output> {
    let runtime = get_runtime()?;
    Ok(runtime.block_on(future))
}

/// Spawn a task on the current runtime.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// A dedicated pool of worker threads shared by every plan that uses it.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Runtime,
    threads: usize,
}

impl WorkerPool {
    /// Create a pool with `threads` workers, or one per core when `None`.
    pub fn new(threads: Option<usize>) -> RivuletResult<Self> {
        let threads = threads.unwrap_or_else(default_parallelism);
        if threads == 0 {
            return Err(RivuletError::invalid_options(
                "worker pool needs at least one thread",
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(|| {
                static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
                format!("rivulet-worker-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
            })
            .enable_time()
            .build()
            .map_err(|e| {
                RivuletError::InternalError(format!("Failed to create worker pool: {e}"))
            })?;

        log::debug!("started worker pool with {threads} threads");
        Ok(Self { runtime, threads })
    }

    /// Handle used to submit tasks to the pool.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Drive a future to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Number of logical cores, falling back to one.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

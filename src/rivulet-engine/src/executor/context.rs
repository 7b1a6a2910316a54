//! Execution context shared by plans and their nodes.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use common_config::RivuletConfig;
use common_error::RivuletResult;

use super::scheduler::{TaskScheduler, TokioScheduler};
use crate::functions::FunctionRegistry;
use crate::memory::{MemoryManager, NoopMemoryManager, TrackingMemoryManager};
use crate::metrics::{MetricsSink, NodeMetrics};
use crate::plan::ExecFactoryRegistry;

/// Everything a node needs from its environment.
///
/// The context is read-only once a plan is built from it. Several plans may
/// share one context; they then share its scheduler, memory budget and
/// metrics table.
#[derive(Clone)]
pub struct ExecContext {
    scheduler: Arc<dyn TaskScheduler>,
    memory: Arc<dyn MemoryManager>,
    metrics: Option<MetricsSink>,
    functions: Arc<FunctionRegistry>,
    factories: Arc<ExecFactoryRegistry>,
    config: RivuletConfig,
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("scheduler", &self.scheduler)
            .field("memory", &self.memory)
            .field("metrics_enabled", &self.metrics.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecContext {
    /// Context with default config, builtin functions and default factories.
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            scheduler,
            memory: Arc::new(NoopMemoryManager),
            metrics: Some(MetricsSink::new()),
            functions: Arc::new(FunctionRegistry::with_builtins()),
            factories: Arc::new(ExecFactoryRegistry::with_defaults()),
            config: RivuletConfig::default(),
        }
    }

    /// Context scheduling onto the caller's tokio runtime.
    pub fn for_current_runtime() -> RivuletResult<Self> {
        Ok(Self::new(Arc::new(TokioScheduler::current()?)))
    }

    /// Context derived from a validated config: memory limit and metrics
    /// switch are taken from `config.execution`.
    pub fn from_config(
        config: RivuletConfig,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> RivuletResult<Self> {
        config.validate()?;
        let memory: Arc<dyn MemoryManager> = match config.execution.memory_limit {
            Some(limit) => Arc::new(TrackingMemoryManager::with_limit(limit)),
            None => Arc::new(TrackingMemoryManager::unlimited()),
        };
        let metrics = config.execution.collect_metrics.then(MetricsSink::new);
        Ok(Self {
            memory,
            metrics,
            config,
            ..Self::new(scheduler)
        })
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryManager>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsSink) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn without_metrics(mut self) -> Self {
        self.metrics = None;
        self
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_factories(mut self, factories: Arc<ExecFactoryRegistry>) -> Self {
        self.factories = factories;
        self
    }

    pub fn with_config(mut self, config: RivuletConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.memory
    }

    pub fn metrics(&self) -> Option<&MetricsSink> {
        self.metrics.as_ref()
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn factories(&self) -> &Arc<ExecFactoryRegistry> {
        &self.factories
    }

    pub fn config(&self) -> &RivuletConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.config.execution.batch_size
    }

    /// Update the metrics of `node`, if collection is enabled.
    pub fn update_metrics<F>(&self, node: &str, f: F)
    where
        F: FnOnce(&mut NodeMetrics),
    {
        if let Some(metrics) = &self.metrics {
            metrics.update(node, f);
        }
    }
}

/// Handle for cancelling an execution from outside the plan.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

//! Local in-process executor.

use std::sync::Arc;

use common_config::RivuletConfig;
use common_error::{RivuletError, RivuletResult};
use common_runtime::WorkerPool;

use crate::executor::{CancellationHandle, ExecContext, ExecutionResult, TokioScheduler};
use crate::metrics::ExecutionTimer;
use crate::operators::SinkNodeOptions;
use crate::plan::{Declaration, ExecPlan};

/// Runs a declaration to completion and collects its output.
///
/// The declaration is capped with a `sink` node whose reader is drained on
/// the calling task. Nodes run on the caller's tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    config: RivuletConfig,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RivuletConfig) -> Self {
        Self { config }
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        let mut config = RivuletConfig::default();
        config.execution = config.execution.with_batch_size(batch_size);
        Self { config }
    }

    pub fn config(&self) -> &RivuletConfig {
        &self.config
    }

    fn context(&self) -> RivuletResult<ExecContext> {
        let scheduler = Arc::new(TokioScheduler::current()?);
        ExecContext::from_config(self.config.clone(), scheduler)
    }

    pub async fn execute(&self, declaration: Declaration) -> RivuletResult<ExecutionResult> {
        self.execute_with_cancellation(declaration, None).await
    }

    /// Execute, stopping the plan if `cancel` fires first.
    pub async fn execute_with_cancellation(
        &self,
        declaration: Declaration,
        cancel: Option<CancellationHandle>,
    ) -> RivuletResult<ExecutionResult> {
        let ctx = self.context()?;
        self.execute_in(ctx, declaration, cancel).await
    }

    /// Execute with a caller-supplied context.
    pub async fn execute_in(
        &self,
        ctx: ExecContext,
        declaration: Declaration,
        cancel: Option<CancellationHandle>,
    ) -> RivuletResult<ExecutionResult> {
        let metrics = ctx.metrics().cloned().unwrap_or_default();
        let plan = ExecPlan::new(ctx);

        let (sink_options, mut reader) = SinkNodeOptions::new();
        let sink = Declaration::sequence(vec![declaration, Declaration::new("sink", sink_options)])?
            .add_to_plan(&plan)?;
        let schema = plan.output_schema(sink)?;

        let timer = ExecutionTimer::start();
        plan.start_producing()?;

        let cancel = cancel.unwrap_or_default();
        let mut batches = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = reader.next() => Some(next),
            };
            match next {
                None => {
                    log::debug!("execution cancelled");
                    plan.stop_producing();
                    let _ = plan.finished().await;
                    return Err(RivuletError::cancelled("query execution cancelled"));
                }
                Some(Err(e)) => {
                    plan.stop_producing();
                    let _ = plan.finished().await;
                    return Err(e);
                }
                Some(Ok(Some(batch))) => {
                    if !batch.is_empty() {
                        batches.push(batch.to_record_batch(schema.clone())?);
                    }
                }
                Some(Ok(None)) => break,
            }
        }

        plan.finished().await?;
        Ok(ExecutionResult::new(batches, schema, metrics, timer.elapsed()))
    }

    /// Execute on a dedicated worker pool, blocking the calling thread.
    pub fn execute_sync(&self, declaration: Declaration) -> RivuletResult<ExecutionResult> {
        let pool = WorkerPool::new(self.config.execution.worker_threads)?;
        pool.block_on(self.execute(declaration))
    }
}

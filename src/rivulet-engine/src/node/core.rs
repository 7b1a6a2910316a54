//! Bookkeeping shared by every node implementation.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arrow::datatypes::SchemaRef;
use futures::FutureExt;
use parking_lot::Mutex;

use common_error::{RivuletError, RivuletResult};

use super::{ExecNode, NodeId, NodeSpec, NodeState};
use crate::batch::ExecBatch;
use crate::executor::{Completion, CompletionSource, ExecContext};
use crate::metrics::ExecutionTimer;
use crate::plan::PlanShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Stopped,
    Errored,
}

#[derive(Debug)]
struct Lifecycle {
    state: NodeState,
    tasks: usize,
    output_done: bool,
    halt: Option<Halt>,
    error: Option<RivuletError>,
    finished: bool,
}

/// Identity, wiring and lifecycle of a node.
///
/// Tracks the tasks a node has in flight and resolves the node's
/// completion once no task is running and the node either delivered all
/// of its output or was halted by a stop or an error. The first of stop
/// and error wins; later terminal signals are ignored.
pub struct NodeCore {
    id: NodeId,
    kind: &'static str,
    default_label: String,
    label: OnceLock<String>,
    inputs: Vec<NodeId>,
    output: OnceLock<NodeId>,
    is_sink: bool,
    schema: SchemaRef,
    plan: Weak<PlanShared>,
    ctx: ExecContext,
    lifecycle: Mutex<Lifecycle>,
    completion: CompletionSource,
    emitted: AtomicU64,
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("label", &self.label())
            .field("inputs", &self.inputs)
            .field("output", &self.output.get())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl NodeCore {
    pub(crate) fn new(id: NodeId, spec: NodeSpec, plan: Weak<PlanShared>, ctx: ExecContext) -> Self {
        Self {
            id,
            kind: spec.kind,
            default_label: format!("{}{id}", spec.kind),
            label: OnceLock::new(),
            inputs: spec.inputs,
            output: OnceLock::new(),
            is_sink: spec.is_sink,
            schema: spec.schema,
            plan,
            ctx,
            lifecycle: Mutex::new(Lifecycle {
                state: NodeState::Created,
                tasks: 0,
                output_done: false,
                halt: None,
                error: None,
                finished: false,
            }),
            completion: CompletionSource::new(),
            emitted: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// User label if set, otherwise `<kind>#<id>`. Metrics are keyed by it.
    pub fn label(&self) -> &str {
        self.label.get().unwrap_or(&self.default_label)
    }

    pub(crate) fn set_label(&self, label: String) -> RivuletResult<()> {
        self.label.set(label).map_err(|label| {
            RivuletError::invalid_state(format!("{} already labelled, cannot relabel as '{label}'", self.label()))
        })
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Position of `input` among this node's inputs.
    pub fn input_index(&self, input: NodeId) -> RivuletResult<usize> {
        self.inputs.iter().position(|&i| i == input).ok_or_else(|| {
            RivuletError::internal(format!("{} is not an input of {}", input, self.label()))
        })
    }

    pub fn output(&self) -> Option<NodeId> {
        self.output.get().copied()
    }

    pub(crate) fn set_output(&self, output: NodeId) -> RivuletResult<()> {
        self.output.set(output).map_err(|_| {
            RivuletError::invalid_options(format!("{} already has a consumer", self.label()))
        })
    }

    pub fn is_sink(&self) -> bool {
        self.is_sink
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn ctx(&self) -> &ExecContext {
        &self.ctx
    }

    pub fn plan(&self) -> &Weak<PlanShared> {
        &self.plan
    }

    /// Look up another node of the same plan.
    pub fn node(&self, id: NodeId) -> Option<Arc<dyn ExecNode>> {
        self.plan.upgrade()?.node(id)
    }

    pub fn state(&self) -> NodeState {
        self.lifecycle.lock().state
    }

    pub(crate) fn mark_started(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == NodeState::Created {
            lifecycle.state = NodeState::Producing;
        }
    }

    /// Reflect a pause or resume in the reported state.
    pub fn set_paused(&self, paused: bool) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = match (lifecycle.state, paused) {
            (NodeState::Producing, true) => NodeState::Paused,
            (NodeState::Paused, false) => NodeState::Producing,
            (state, _) => state,
        };
    }

    /// Stopped or failed.
    pub fn is_halted(&self) -> bool {
        self.lifecycle.lock().halt.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle.lock().halt == Some(Halt::Stopped)
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.lock().finished
    }

    pub fn completion(&self) -> Completion {
        self.completion.completion()
    }

    /// Batches delivered to the output so far.
    pub fn emitted_batches(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }

    pub fn record_input(&self, rows: usize) {
        self.ctx.update_metrics(self.label(), |m| m.record_input(rows));
    }

    pub fn record_pause(&self) {
        self.ctx.update_metrics(self.label(), |m| m.pauses += 1);
    }

    pub fn record_memory(&self, bytes: usize) {
        self.ctx.update_metrics(self.label(), |m| m.update_memory(bytes));
    }

    /// Deliver `batch` to the output. Dropped once the node is halted.
    pub fn emit(&self, batch: ExecBatch) {
        if self.is_halted() {
            log::trace!("{} dropping batch after halt", self.label());
            return;
        }
        if let Err(e) = batch.validate_schema(&self.schema) {
            self.fail(e);
            return;
        }
        let Some(output) = self.output().and_then(|id| self.node(id)) else {
            return;
        };
        let rows = batch.num_rows();
        self.emitted.fetch_add(1, Ordering::SeqCst);
        self.ctx.update_metrics(self.label(), |m| m.record_output(rows));
        output.input_received(self.id, batch);
    }

    /// Tell the output how many batches it will receive in total.
    pub fn send_input_finished(&self, total: u64) {
        if self.is_halted() {
            return;
        }
        if let Some(output) = self.output().and_then(|id| self.node(id)) {
            log::trace!("{} finished output after {total} batches", self.label());
            output.input_finished(self.id, total);
        }
    }

    /// All output has been delivered (or consumed, for a sink).
    pub fn mark_output_done(&self) {
        self.lifecycle.lock().output_done = true;
        self.try_finish();
    }

    pub fn finish_output(&self, total: u64) {
        self.send_input_finished(total);
        self.mark_output_done();
    }

    /// Fail the node: forward the error downstream once, stop the inputs.
    pub fn fail(&self, error: RivuletError) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.halt.is_some() {
                log::debug!("{} ignoring error after halt: {error}", self.label());
                return;
            }
            lifecycle.halt = Some(Halt::Errored);
            lifecycle.state = NodeState::Stopped;
            lifecycle.error = Some(error.clone());
        }
        log::warn!("{} failed: {error}", self.label());
        if let Some(output) = self.output().and_then(|id| self.node(id)) {
            output.error_received(self.id, error);
        }
        self.stop_inputs();
        self.try_finish();
    }

    /// Stop producing and stop the inputs. Idempotent.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.halt.is_some() {
                return;
            }
            lifecycle.halt = Some(Halt::Stopped);
            lifecycle.state = NodeState::Stopped;
        }
        log::debug!("{} stopped", self.label());
        self.stop_inputs();
        self.try_finish();
    }

    fn stop_inputs(&self) {
        for &input in &self.inputs {
            if let Some(node) = self.node(input) {
                node.stop_producing_output(self.id);
            }
        }
    }

    pub fn pause_inputs(&self, counter: u64) {
        for &input in &self.inputs {
            if let Some(node) = self.node(input) {
                node.pause_producing(self.id, counter);
            }
        }
    }

    pub fn resume_inputs(&self, counter: u64) {
        for &input in &self.inputs {
            if let Some(node) = self.node(input) {
                node.resume_producing(self.id, counter);
            }
        }
    }

    /// Run `task` on the scheduler as work owned by `node`.
    ///
    /// The node's completion waits for the task. An error or panic in the
    /// task is reported through `node.task_failed`. Tasks submitted after
    /// the node finished are dropped.
    pub fn spawn<F>(&self, node: Arc<dyn ExecNode>, name: &'static str, task: F)
    where
        F: Future<Output = RivuletResult<()>> + Send + 'static,
    {
        if !self.begin_task() {
            log::trace!("{} dropping {name} task after finish", self.label());
            return;
        }
        let wrapped = async move {
            let timer = ExecutionTimer::start();
            let outcome = AssertUnwindSafe(task).catch_unwind().await;
            let core = node.core();
            core.ctx.update_metrics(core.label(), |m| m.add_time(timer.elapsed()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => node.task_failed(e),
                Err(panic) => node.task_failed(RivuletError::task_panicked(format!(
                    "{} task '{name}': {}",
                    core.label(),
                    panic_message(panic.as_ref())
                ))),
            }
            core.end_task();
        };
        if let Err(e) = self.ctx.scheduler().submit(name, Box::pin(wrapped)) {
            self.end_task();
            self.fail(e);
        }
    }

    fn begin_task(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.finished {
            return false;
        }
        lifecycle.tasks += 1;
        true
    }

    fn end_task(&self) {
        self.lifecycle.lock().tasks -= 1;
        self.try_finish();
    }

    fn try_finish(&self) {
        let result = {
            let mut lifecycle = self.lifecycle.lock();
            let done = lifecycle.output_done || lifecycle.halt.is_some();
            if lifecycle.finished || lifecycle.tasks > 0 || !done {
                return;
            }
            lifecycle.finished = true;
            if lifecycle.halt.is_none() {
                lifecycle.state = NodeState::Finished;
            }
            lifecycle.error.clone().map_or(Ok(()), Err)
        };
        log::debug!("{} finished", self.label());
        self.completion.resolve(result);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

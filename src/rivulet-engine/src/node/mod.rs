//! The push-based node protocol.
//!
//! Data flows downstream: a producer calls `input_received` on its single
//! consumer, then `input_finished` with the number of batches it sent.
//! Control flows upstream: `pause_producing`, `resume_producing` and
//! `stop_producing_output` travel from a consumer to its inputs.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start──▶ Producing ◀──resume── Paused
//!                        │   └──pause──────▲
//!                        ├──stop / error──▶ Stopped
//!                        └──output done──▶ Finished
//! ```
//!
//! A node's [`Completion`] resolves exactly once, after its output is done
//! (or it was stopped or failed) and every task it spawned has ended.
//!
//! Nodes never call each other while holding their own state lock across
//! an `input_received` call, so a consumer may safely pause its producer
//! from inside `input_received`.

mod core;
mod counter;

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use common_error::{RivuletError, RivuletResult};

use crate::batch::ExecBatch;
use crate::executor::Completion;

pub use self::core::NodeCore;
pub use counter::BatchCounter;

/// Position of a node in its plan's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Created,
    Producing,
    Paused,
    Stopped,
    Finished,
}

/// Static properties used for display and planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCaps {
    /// Consumes all input before producing output.
    pub blocking: bool,
    /// Keeps no state between batches.
    pub stateless: bool,
}

impl NodeCaps {
    pub const fn streaming() -> Self {
        Self {
            blocking: false,
            stateless: true,
        }
    }

    pub const fn blocking() -> Self {
        Self {
            blocking: true,
            stateless: false,
        }
    }

    pub const fn source() -> Self {
        Self {
            blocking: false,
            stateless: false,
        }
    }
}

/// Description of a node handed to [`ExecPlan::add_node`].
///
/// [`ExecPlan::add_node`]: crate::plan::ExecPlan::add_node
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub kind: &'static str,
    pub inputs: Vec<NodeId>,
    /// Output schema; for sinks, the schema of what they consume.
    pub schema: SchemaRef,
    pub is_sink: bool,
}

impl NodeSpec {
    pub fn new(kind: &'static str, inputs: Vec<NodeId>, schema: SchemaRef) -> Self {
        Self {
            kind,
            inputs,
            schema,
            is_sink: false,
        }
    }

    pub fn sink(kind: &'static str, inputs: Vec<NodeId>, schema: SchemaRef) -> Self {
        Self {
            is_sink: true,
            ..Self::new(kind, inputs, schema)
        }
    }
}

/// A vertex of an [`ExecPlan`](crate::plan::ExecPlan).
///
/// Methods that may schedule work take `self: Arc<Self>` so the node can
/// hand a reference to its own tasks. All callbacks must return quickly;
/// heavy work goes through [`NodeCore::spawn`].
pub trait ExecNode: Send + Sync + fmt::Debug {
    /// Shared bookkeeping for this node.
    fn core(&self) -> &NodeCore;

    fn kind_name(&self) -> &'static str {
        self.core().kind()
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::streaming()
    }

    /// Extra detail shown by `ExecPlan::explain`.
    fn describe(&self) -> Option<String> {
        None
    }

    /// Called once by the plan, sources first.
    fn start_producing(self: Arc<Self>) -> RivuletResult<()> {
        Ok(())
    }

    /// A batch from `input`. Must not block.
    fn input_received(self: Arc<Self>, input: NodeId, batch: ExecBatch);

    /// `input` will send `total` batches in all.
    fn input_finished(self: Arc<Self>, input: NodeId, total: u64);

    /// `input` failed; it will send nothing more.
    fn error_received(&self, input: NodeId, error: RivuletError) {
        log::debug!("{} received error from {input}", self.core().label());
        self.core().fail(error);
    }

    fn pause_producing(&self, _output: NodeId, counter: u64) {
        self.core().pause_inputs(counter);
    }

    fn resume_producing(self: Arc<Self>, _output: NodeId, counter: u64) {
        self.core().resume_inputs(counter);
    }

    /// The consumer `output` no longer wants data.
    fn stop_producing_output(&self, _output: NodeId) {
        self.stop_producing();
    }

    /// Stop everything. Idempotent.
    fn stop_producing(&self) {
        self.core().stop();
    }

    /// A task owned by this node returned an error or panicked.
    fn task_failed(&self, error: RivuletError) {
        self.core().fail(error);
    }

    fn finished(&self) -> Completion {
        self.core().completion()
    }
}

/// Reject a node built with the wrong number of inputs.
pub fn validate_input_count(kind: &str, inputs: &[NodeId], expected: usize) -> RivuletResult<()> {
    if inputs.len() != expected {
        return Err(RivuletError::invalid_options(format!(
            "{kind} expects {expected} input(s), got {}",
            inputs.len()
        )));
    }
    Ok(())
}

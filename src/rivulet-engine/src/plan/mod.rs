//! Execution plans.
//!
//! An [`ExecPlan`] owns its nodes in an arena addressed by [`NodeId`].
//! Nodes only hold a weak handle back to the plan, so dropping the plan
//! tears the graph down even while tasks are still draining.

mod declaration;
mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::datatypes::SchemaRef;
use parking_lot::RwLock;

use common_display::{DisplayTree, OwnedTreeNode};
use common_error::{RivuletError, RivuletResult};

use crate::executor::{Completion, CompletionSource, ExecContext};
use crate::node::{ExecNode, NodeCore, NodeId, NodeSpec};

pub use declaration::Declaration;
pub use registry::{ExecFactory, ExecFactoryRegistry, ExecNodeOptions, downcast_options};

/// State reachable from nodes through their weak plan handle.
pub struct PlanShared {
    ctx: ExecContext,
    nodes: RwLock<Vec<Arc<dyn ExecNode>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    completion: Arc<CompletionSource>,
}

impl PlanShared {
    pub fn node(&self, id: NodeId) -> Option<Arc<dyn ExecNode>> {
        self.nodes.read().get(id.index()).cloned()
    }

    pub fn ctx(&self) -> &ExecContext {
        &self.ctx
    }
}

/// A DAG of nodes executed by push.
pub struct ExecPlan {
    shared: Arc<PlanShared>,
}

impl std::fmt::Debug for ExecPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecPlan")
            .field("nodes", &self.num_nodes())
            .field("started", &self.is_started())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ExecPlan {
    pub fn new(ctx: ExecContext) -> Self {
        Self {
            shared: Arc::new(PlanShared {
                ctx,
                nodes: RwLock::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                completion: Arc::new(CompletionSource::new()),
            }),
        }
    }

    pub fn context(&self) -> &ExecContext {
        &self.shared.ctx
    }

    /// Insert a node built from its core.
    ///
    /// `build` runs under the plan's arena lock; read anything it needs
    /// from the plan (input schemas) before calling this.
    pub fn add_node<N, F>(&self, spec: NodeSpec, build: F) -> RivuletResult<NodeId>
    where
        N: ExecNode + 'static,
        F: FnOnce(NodeCore) -> RivuletResult<N>,
    {
        if self.is_started() {
            return Err(RivuletError::invalid_state("cannot add nodes to a started plan"));
        }
        let mut nodes = self.shared.nodes.write();
        for (i, input) in spec.inputs.iter().enumerate() {
            let Some(node) = nodes.get(input.index()) else {
                return Err(RivuletError::invalid_options(format!(
                    "{} input {input} does not exist",
                    spec.kind
                )));
            };
            let core = node.core();
            if core.is_sink() {
                return Err(RivuletError::invalid_options(format!(
                    "{} cannot consume sink {}",
                    spec.kind,
                    core.label()
                )));
            }
            if core.output().is_some() {
                return Err(RivuletError::invalid_options(format!(
                    "{} already has a consumer",
                    core.label()
                )));
            }
            if spec.inputs[..i].contains(input) {
                return Err(RivuletError::invalid_options(format!(
                    "{} lists input {input} twice",
                    spec.kind
                )));
            }
        }

        let id = NodeId::new(nodes.len());
        let inputs = spec.inputs.clone();
        let core = NodeCore::new(
            id,
            spec,
            Arc::downgrade(&self.shared),
            self.shared.ctx.clone(),
        );
        let node: Arc<dyn ExecNode> = Arc::new(build(core)?);
        for input in inputs {
            nodes[input.index()].core().set_output(id)?;
        }
        log::debug!("added {} to plan", node.core().label());
        nodes.push(node);
        Ok(id)
    }

    /// Build a node through the context's factory registry.
    pub fn make_node(
        &self,
        factory: &str,
        inputs: Vec<NodeId>,
        options: Box<dyn ExecNodeOptions>,
    ) -> RivuletResult<NodeId> {
        let factory_fn = self.context().factories().get(factory)?;
        factory_fn(self, inputs, options)
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<dyn ExecNode>> {
        self.shared.node(id)
    }

    pub fn nodes(&self) -> Vec<Arc<dyn ExecNode>> {
        self.shared.nodes.read().clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.shared.nodes.read().len()
    }

    pub fn sinks(&self) -> Vec<Arc<dyn ExecNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| n.core().is_sink())
            .collect()
    }

    /// Output schema of `id`, for factories wiring a new node to it.
    pub fn output_schema(&self, id: NodeId) -> RivuletResult<SchemaRef> {
        self.node(id)
            .map(|n| n.core().schema().clone())
            .ok_or_else(|| RivuletError::not_found(format!("node {id}")))
    }

    pub fn set_label(&self, id: NodeId, label: impl Into<String>) -> RivuletResult<()> {
        self.node(id)
            .ok_or_else(|| RivuletError::not_found(format!("node {id}")))?
            .core()
            .set_label(label.into())
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn validate(nodes: &[Arc<dyn ExecNode>]) -> RivuletResult<()> {
        if nodes.is_empty() {
            return Err(RivuletError::invalid_state("plan has no nodes"));
        }
        let mut has_sink = false;
        for node in nodes {
            let core = node.core();
            if core.is_sink() {
                has_sink = true;
            } else if core.output().is_none() {
                return Err(RivuletError::invalid_state(format!(
                    "{} has no consumer",
                    core.label()
                )));
            }
        }
        if !has_sink {
            return Err(RivuletError::invalid_state("plan has no sink"));
        }
        Ok(())
    }

    /// Validate the graph and start every node, sources first.
    ///
    /// If a node fails to start, every node is stopped and the plan's
    /// completion resolves with the start error once they have finished.
    pub fn start_producing(&self) -> RivuletResult<()> {
        let nodes = self.nodes();
        Self::validate(&nodes)?;
        if self.is_stopped() {
            return Err(RivuletError::invalid_state("plan was stopped before starting"));
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(RivuletError::invalid_state("plan already started"));
        }
        log::debug!("starting plan with {} nodes", nodes.len());

        let completions: Vec<Completion> = nodes.iter().map(|n| n.finished()).collect();
        for node in &nodes {
            node.core().mark_started();
        }

        let mut start_error = None;
        for node in &nodes {
            if let Err(e) = Arc::clone(node).start_producing() {
                log::warn!("{} failed to start: {e}", node.core().label());
                start_error = Some(e);
                break;
            }
        }

        let source = Arc::clone(&self.shared.completion);
        let aggregate: futures::future::BoxFuture<'static, ()> = match &start_error {
            None => Box::pin(async move {
                let result = Completion::all(completions).await;
                log::debug!("plan finished: {result:?}");
                source.resolve(result);
            }),
            Some(e) => {
                let error = e.clone();
                Box::pin(async move {
                    let _ = Completion::all(completions).await;
                    source.resolve(Err(error));
                })
            }
        };
        if let Err(e) = self.context().scheduler().submit("plan-finished", aggregate) {
            self.shared.completion.resolve(Err(e.clone()));
            return Err(e);
        }

        match start_error {
            None => Ok(()),
            Some(e) => {
                self.shared.stopped.store(true, Ordering::SeqCst);
                for node in &nodes {
                    node.stop_producing();
                }
                Err(e)
            }
        }
    }

    /// Ask every sink to stop. Idempotent and callable from any thread.
    pub fn stop_producing(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.is_started() {
            log::debug!("stopping plan that never started");
            self.shared.completion.resolve(Ok(()));
            return;
        }
        log::debug!("stopping plan");
        for sink in self.sinks() {
            sink.stop_producing();
        }
    }

    /// Resolves when every node has finished. Ok only if all succeeded.
    pub fn finished(&self) -> Completion {
        self.shared.completion.completion()
    }

    /// Tree of nodes from each sink down to its sources.
    pub fn explain(&self) -> String {
        let nodes = self.nodes();
        let mut output = String::new();
        for sink in nodes.iter().filter(|n| n.core().is_sink()) {
            let tree = Self::explain_node(&nodes, sink);
            output.push_str(&DisplayTree::new(&tree).to_string());
        }
        output
    }

    fn explain_node(nodes: &[Arc<dyn ExecNode>], node: &Arc<dyn ExecNode>) -> OwnedTreeNode {
        let core = node.core();
        let mut tree = OwnedTreeNode::new(core.label());
        if let Some(details) = node.describe() {
            tree = tree.with_details(details);
        }
        for input in core.inputs() {
            if let Some(child) = nodes.get(input.index()) {
                tree = tree.with_child(Self::explain_node(nodes, child));
            }
        }
        tree
    }
}

impl Drop for ExecPlan {
    fn drop(&mut self) {
        let finished = self.shared.completion.is_resolved();
        if self.is_started() && !finished && !self.is_stopped() {
            log::debug!("dropping running plan; stopping it");
            self.stop_producing();
        }
    }
}

//! Shared driver for one-batch-in, one-batch-out nodes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backpressure::PauseSet;
use crate::batch::ExecBatch;
use crate::node::{BatchCounter, ExecNode, NodeCaps, NodeCore, NodeId};
use common_error::RivuletResult;

/// The per-batch transform of a map node.
pub(crate) trait MapFunction: Send + Sync + fmt::Debug + 'static {
    fn map(&self, core: &NodeCore, batch: ExecBatch) -> RivuletResult<ExecBatch>;

    fn describe(&self) -> String;
}

/// Runs one task per input batch and emits exactly one batch for each,
/// keeping its index, so the input's batch total is forwarded as is.
#[derive(Debug)]
pub(crate) struct MapNode<M> {
    core: NodeCore,
    function: M,
    counter: BatchCounter,
    /// Pauses seen from the consumer, for the reported state only.
    pauses: Mutex<PauseSet>,
}

impl<M: MapFunction> MapNode<M> {
    pub(crate) fn new(core: NodeCore, function: M) -> Self {
        Self {
            core,
            function,
            counter: BatchCounter::new(),
            pauses: Mutex::new(PauseSet::new()),
        }
    }

    fn process(&self, batch: ExecBatch) -> RivuletResult<()> {
        let index = batch.index;
        let mut output = self.function.map(&self.core, batch)?;
        output.index = index;
        self.core.emit(output);
        if self.counter.increment() {
            self.core.mark_output_done();
        }
        Ok(())
    }
}

impl<M: MapFunction> ExecNode for MapNode<M> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::streaming()
    }

    fn describe(&self) -> Option<String> {
        Some(self.function.describe())
    }

    fn input_received(self: Arc<Self>, _input: NodeId, batch: ExecBatch) {
        if self.core.is_halted() {
            return;
        }
        self.core.record_input(batch.num_rows());
        let node = Arc::clone(&self);
        self.core
            .spawn(self.clone(), self.core.kind(), async move { node.process(batch) });
    }

    fn input_finished(self: Arc<Self>, _input: NodeId, total: u64) {
        self.core.send_input_finished(total);
        if self.counter.set_total(total) {
            self.core.mark_output_done();
        }
    }

    fn pause_producing(&self, output: NodeId, counter: u64) {
        {
            let mut pauses = self.pauses.lock();
            if pauses.pause(output, counter) {
                self.core.set_paused(pauses.is_paused());
            }
        }
        self.core.pause_inputs(counter);
    }

    fn resume_producing(self: Arc<Self>, output: NodeId, counter: u64) {
        {
            let mut pauses = self.pauses.lock();
            if pauses.resume(output, counter) {
                self.core.set_paused(pauses.is_paused());
            }
        }
        self.core.resume_inputs(counter);
    }
}

//! Push sink driving a user-supplied consumer.

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use async_trait::async_trait;

use common_error::RivuletResult;

use crate::backpressure::{BackpressureControl, NodeEdge};
use crate::batch::ExecBatch;
use crate::node::{BatchCounter, ExecNode, NodeCaps, NodeCore, NodeId, NodeSpec, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

/// Receives every batch reaching a `consuming_sink`.
///
/// `consume` may be called concurrently from several workers. The node
/// finishes only after `finish` resolves. The consumer applies its own
/// flow control with the [`BackpressureControl`] handed to `init`.
#[async_trait]
pub trait SinkConsumer: Send + Sync {
    fn init(&self, schema: &SchemaRef, backpressure: BackpressureControl) -> RivuletResult<()>;

    fn consume(&self, batch: ExecBatch) -> RivuletResult<()>;

    async fn finish(&self) -> RivuletResult<()>;
}

/// Options for the `consuming_sink` factory.
#[derive(Clone)]
pub struct ConsumingSinkNodeOptions {
    pub consumer: Arc<dyn SinkConsumer>,
}

impl fmt::Debug for ConsumingSinkNodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumingSinkNodeOptions").finish_non_exhaustive()
    }
}

impl ConsumingSinkNodeOptions {
    pub fn new(consumer: Arc<dyn SinkConsumer>) -> Self {
        Self { consumer }
    }
}

pub struct ConsumingSinkNode {
    core: NodeCore,
    consumer: Arc<dyn SinkConsumer>,
    counter: BatchCounter,
}

impl fmt::Debug for ConsumingSinkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumingSinkNode")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl ConsumingSinkNode {
    fn finish(self: Arc<Self>) {
        let consumer = Arc::clone(&self.consumer);
        let node = Arc::clone(&self);
        self.core.spawn(self.clone(), "consumer-finish", async move {
            consumer.finish().await?;
            node.core.mark_output_done();
            Ok(())
        });
    }
}

impl ExecNode for ConsumingSinkNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::streaming()
    }

    fn input_received(self: Arc<Self>, _input: NodeId, batch: ExecBatch) {
        if self.core.is_halted() {
            return;
        }
        self.core.record_input(batch.num_rows());
        let node = Arc::clone(&self);
        self.core.spawn(self.clone(), "consume", async move {
            node.consumer.consume(batch)?;
            if node.counter.increment() {
                Arc::clone(&node).finish();
            }
            Ok(())
        });
    }

    fn input_finished(self: Arc<Self>, _input: NodeId, total: u64) {
        if self.counter.set_total(total) {
            self.finish();
        }
    }
}

/// Factory for `consuming_sink`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("consuming_sink", &inputs, 1)?;
    let options = downcast_options::<ConsumingSinkNodeOptions>(options, "consuming_sink")?;
    let input = inputs[0];
    let schema = plan.output_schema(input)?;
    let spec = NodeSpec::sink("consuming_sink", inputs, schema.clone());
    plan.add_node(spec, |core| {
        let edge = NodeEdge::new(core.plan().clone(), input, core.id());
        options
            .consumer
            .init(&schema, BackpressureControl::new(Arc::new(edge)))?;
        Ok(ConsumingSinkNode {
            core,
            consumer: options.consumer,
            counter: BatchCounter::new(),
        })
    })
}

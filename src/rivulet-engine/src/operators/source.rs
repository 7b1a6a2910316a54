//! Source nodes.
//!
//! A source pulls one batch at a time from an async stream. Each pull is
//! its own task, and the next pull is only scheduled while the source is
//! neither paused nor stopped, so a paused source holds no worker.

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use common_error::{RivuletError, RivuletResult};

use crate::backpressure::PauseSet;
use crate::batch::ExecBatch;
use crate::node::{ExecNode, NodeCaps, NodeCore, NodeId, NodeSpec, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

/// Options for the `source` factory.
pub struct SourceNodeOptions {
    pub schema: SchemaRef,
    pub generator: BoxStream<'static, RivuletResult<ExecBatch>>,
}

impl fmt::Debug for SourceNodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceNodeOptions")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SourceNodeOptions {
    pub fn new(schema: SchemaRef, generator: BoxStream<'static, RivuletResult<ExecBatch>>) -> Self {
        Self { schema, generator }
    }

    /// Source replaying a fixed list of batches.
    pub fn from_batches(schema: SchemaRef, batches: Vec<ExecBatch>) -> Self {
        Self::new(schema, futures::stream::iter(batches.into_iter().map(Ok)).boxed())
    }
}

/// Options for the `table_source` factory.
#[derive(Debug, Clone)]
pub struct TableSourceNodeOptions {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    /// Defaults to the context's batch size.
    pub max_batch_size: Option<usize>,
}

impl TableSourceNodeOptions {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            batches,
            max_batch_size: None,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    fn into_source(self, default_batch_size: usize) -> RivuletResult<SourceNodeOptions> {
        let max = self.max_batch_size.unwrap_or(default_batch_size);
        if max == 0 {
            return Err(RivuletError::invalid_options("max_batch_size must be positive"));
        }
        let mut slices = Vec::new();
        for batch in &self.batches {
            if batch.schema().fields() != self.schema.fields() {
                return Err(RivuletError::schema_error(format!(
                    "table batch schema {:?} does not match source schema {:?}",
                    batch.schema(),
                    self.schema
                )));
            }
            let mut offset = 0;
            while offset < batch.num_rows() {
                let len = max.min(batch.num_rows() - offset);
                slices.push(ExecBatch::from_record_batch(&batch.slice(offset, len)));
                offset += len;
            }
        }
        Ok(SourceNodeOptions::from_batches(self.schema, slices))
    }
}

#[derive(Default)]
struct SourceState {
    /// Taken while a pull is in flight; dropped on stop.
    generator: Option<BoxStream<'static, RivuletResult<ExecBatch>>>,
    pauses: PauseSet,
    pulling: bool,
    next_index: u64,
    exhausted: bool,
}

pub struct SourceNode {
    core: NodeCore,
    state: Mutex<SourceState>,
}

impl fmt::Debug for SourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SourceNode")
            .field("core", &self.core)
            .field("next_index", &state.next_index)
            .field("exhausted", &state.exhausted)
            .finish()
    }
}

impl SourceNode {
    fn schedule_pull(self: &Arc<Self>) {
        let generator = {
            let mut state = self.state.lock();
            if state.exhausted || state.pulling || state.pauses.is_paused() || self.core.is_halted() {
                return;
            }
            let Some(generator) = state.generator.take() else {
                return;
            };
            state.pulling = true;
            generator
        };
        let node = Arc::clone(self);
        self.core
            .spawn(Arc::clone(self) as Arc<dyn ExecNode>, "source-pull", node.pull(generator));
    }

    async fn pull(
        self: Arc<Self>,
        mut generator: BoxStream<'static, RivuletResult<ExecBatch>>,
    ) -> RivuletResult<()> {
        match generator.next().await {
            Some(Ok(batch)) => {
                let index = {
                    let mut state = self.state.lock();
                    let index = state.next_index;
                    state.next_index += 1;
                    index
                };
                self.core.emit(batch.with_index(index));
                {
                    let mut state = self.state.lock();
                    state.pulling = false;
                    if !self.core.is_halted() {
                        state.generator = Some(generator);
                    }
                }
                self.schedule_pull();
                Ok(())
            }
            None => {
                let total = {
                    let mut state = self.state.lock();
                    state.pulling = false;
                    state.exhausted = true;
                    state.next_index
                };
                log::debug!("{} exhausted after {total} batches", self.core.label());
                self.core.finish_output(total);
                Ok(())
            }
            Some(Err(e)) => {
                self.state.lock().pulling = false;
                Err(e)
            }
        }
    }
}

impl ExecNode for SourceNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::source()
    }

    fn start_producing(self: Arc<Self>) -> RivuletResult<()> {
        self.schedule_pull();
        Ok(())
    }

    fn input_received(self: Arc<Self>, input: NodeId, _batch: ExecBatch) {
        self.core
            .fail(RivuletError::internal(format!("source received a batch from {input}")));
    }

    fn input_finished(self: Arc<Self>, _input: NodeId, _total: u64) {}

    fn pause_producing(&self, output: NodeId, counter: u64) {
        let mut state = self.state.lock();
        if state.pauses.pause(output, counter) {
            self.core.set_paused(state.pauses.is_paused());
        }
    }

    fn resume_producing(self: Arc<Self>, output: NodeId, counter: u64) {
        {
            let mut state = self.state.lock();
            if !state.pauses.resume(output, counter) || state.pauses.is_paused() {
                return;
            }
            self.core.set_paused(false);
        }
        self.schedule_pull();
    }

    fn stop_producing(&self) {
        self.core.stop();
        self.state.lock().generator = None;
    }
}

fn add_source(plan: &ExecPlan, options: SourceNodeOptions) -> RivuletResult<NodeId> {
    let spec = NodeSpec::new("source", vec![], options.schema);
    plan.add_node(spec, |core| {
        Ok(SourceNode {
            core,
            state: Mutex::new(SourceState {
                generator: Some(options.generator),
                ..SourceState::default()
            }),
        })
    })
}

/// Factory for `source`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("source", &inputs, 0)?;
    add_source(plan, downcast_options::<SourceNodeOptions>(options, "source")?)
}

/// Factory for `table_source`.
pub fn make_table(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("table_source", &inputs, 0)?;
    let options = downcast_options::<TableSourceNodeOptions>(options, "table_source")?;
    add_source(plan, options.into_source(plan.context().batch_size())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]))
    }

    #[test]
    fn test_table_slicing() {
        let batch = RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int64Array::from_iter_values(0..25))],
        )
        .unwrap();
        let options = TableSourceNodeOptions::new(schema(), vec![batch]).with_max_batch_size(10);
        let source = options.into_source(1024).unwrap();
        let sizes: Vec<usize> = futures::executor::block_on(
            source.generator.map(|b| b.unwrap().num_rows()).collect::<Vec<_>>(),
        );
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_table_rejects_bad_options() {
        let options = TableSourceNodeOptions::new(schema(), vec![]).with_max_batch_size(0);
        assert!(options.into_source(1024).is_err());

        let other = Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(other, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap();
        let err = TableSourceNodeOptions::new(schema(), vec![batch])
            .into_source(1024)
            .unwrap_err();
        assert!(matches!(err, RivuletError::SchemaError(_)));
    }
}

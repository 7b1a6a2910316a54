//! Order-by sink.

use std::fmt;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use common_error::RivuletResult;

use super::sink::{SinkOutput, SinkReader, sink_channel};
use super::sort::{NullPlacement, SortAccumulator, SortKey, add_sorting_sink, sort_batch, validate_sort_keys};
use crate::node::{NodeId, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

/// Options for the `order_by_sink` factory.
pub struct OrderByNodeOptions {
    pub keys: Vec<SortKey>,
    pub null_placement: NullPlacement,
    output: SinkOutput,
}

impl fmt::Debug for OrderByNodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderByNodeOptions")
            .field("keys", &self.keys)
            .field("null_placement", &self.null_placement)
            .finish_non_exhaustive()
    }
}

impl OrderByNodeOptions {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(keys: Vec<SortKey>) -> (Self, SinkReader) {
        let (output, reader) = sink_channel();
        let options = Self {
            keys,
            null_placement: NullPlacement::default(),
            output,
        };
        (options, reader)
    }

    pub fn with_null_placement(mut self, null_placement: NullPlacement) -> Self {
        self.null_placement = null_placement;
        self
    }
}

#[derive(Debug)]
struct OrderBy {
    schema: SchemaRef,
    keys: Vec<SortKey>,
    null_placement: NullPlacement,
    batches: Vec<RecordBatch>,
    size: usize,
}

impl SortAccumulator for OrderBy {
    fn add(&mut self, batch: RecordBatch) -> RivuletResult<()> {
        self.size += batch.get_array_memory_size();
        self.batches.push(batch);
        Ok(())
    }

    fn finish(&mut self) -> RivuletResult<RecordBatch> {
        let batches = std::mem::take(&mut self.batches);
        self.size = 0;
        let all = concat_batches(&self.schema, &batches)?;
        drop(batches);
        sort_batch(&all, &self.keys, self.null_placement, None)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn describe(&self) -> String {
        let keys: Vec<String> = self.keys.iter().map(ToString::to_string).collect();
        keys.join(", ")
    }
}

/// Factory for `order_by_sink`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("order_by_sink", &inputs, 1)?;
    let options = downcast_options::<OrderByNodeOptions>(options, "order_by_sink")?;
    validate_sort_keys(&options.keys, &plan.output_schema(inputs[0])?)?;
    let OrderByNodeOptions {
        keys,
        null_placement,
        output,
    } = options;
    add_sorting_sink(plan, "order_by_sink", inputs[0], output, |schema| OrderBy {
        schema,
        keys,
        null_placement,
        batches: Vec::new(),
        size: 0,
    })
}

//! Top-k sink.

use std::fmt;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use common_error::{RivuletError, RivuletResult};

use super::sink::{SinkOutput, SinkReader, sink_channel};
use super::sort::{NullPlacement, SortAccumulator, SortKey, add_sorting_sink, sort_batch, validate_sort_keys};
use crate::node::{NodeId, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

/// Options for the `select_k_sink` factory.
pub struct SelectKNodeOptions {
    pub k: usize,
    pub keys: Vec<SortKey>,
    pub null_placement: NullPlacement,
    output: SinkOutput,
}

impl fmt::Debug for SelectKNodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectKNodeOptions")
            .field("k", &self.k)
            .field("keys", &self.keys)
            .field("null_placement", &self.null_placement)
            .finish_non_exhaustive()
    }
}

impl SelectKNodeOptions {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(k: usize, keys: Vec<SortKey>) -> (Self, SinkReader) {
        let (output, reader) = sink_channel();
        let options = Self {
            k,
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

/// Keeps the best `k` rows seen so far, already sorted.
#[derive(Debug)]
struct SelectK {
    schema: SchemaRef,
    k: usize,
    keys: Vec<SortKey>,
    null_placement: NullPlacement,
    candidates: Option<RecordBatch>,
}

impl SortAccumulator for SelectK {
    fn add(&mut self, batch: RecordBatch) -> RivuletResult<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let merged = match self.candidates.take() {
            Some(candidates) => concat_batches(&self.schema, [&candidates, &batch])?,
            None => batch,
        };
        self.candidates = Some(sort_batch(
            &merged,
            &self.keys,
            self.null_placement,
            Some(self.k),
        )?);
        Ok(())
    }

    fn finish(&mut self) -> RivuletResult<RecordBatch> {
        Ok(self
            .candidates
            .take()
            .unwrap_or_else(|| RecordBatch::new_empty(self.schema.clone())))
    }

    fn size(&self) -> usize {
        self.candidates
            .as_ref()
            .map_or(0, RecordBatch::get_array_memory_size)
    }

    fn describe(&self) -> String {
        let keys: Vec<String> = self.keys.iter().map(ToString::to_string).collect();
        format!("k={}, {}", self.k, keys.join(", "))
    }
}

/// Factory for `select_k_sink`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("select_k_sink", &inputs, 1)?;
    let options = downcast_options::<SelectKNodeOptions>(options, "select_k_sink")?;
    if options.k == 0 {
        return Err(RivuletError::invalid_options("select_k_sink requires k > 0"));
    }
    validate_sort_keys(&options.keys, &plan.output_schema(inputs[0])?)?;
    let SelectKNodeOptions {
        k,
        keys,
        null_placement,
        output,
    } = options;
    add_sorting_sink(plan, "select_k_sink", inputs[0], output, |schema| SelectK {
        schema,
        k,
        keys,
        null_placement,
        candidates: None,
    })
}

//! Sort keys and the accumulating sink shared by `order_by_sink` and
//! `select_k_sink`.

use std::fmt;
use std::sync::Arc;

use arrow::compute::{SortColumn, SortOptions, lexsort_to_indices, take_record_batch};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use common_error::{RivuletError, RivuletResult};

use super::sink::SinkOutput;
use crate::batch::ExecBatch;
use crate::memory::MemoryReservation;
use crate::node::{BatchCounter, ExecNode, NodeCaps, NodeCore, NodeId, NodeSpec};
use crate::plan::ExecPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Where nulls go, independent of the sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPlacement {
    AtStart,
    #[default]
    AtEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Descending,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.order {
            SortOrder::Ascending => write!(f, "{} ASC", self.column),
            SortOrder::Descending => write!(f, "{} DESC", self.column),
        }
    }
}

pub(crate) fn validate_sort_keys(keys: &[SortKey], schema: &SchemaRef) -> RivuletResult<()> {
    if keys.is_empty() {
        return Err(RivuletError::invalid_options("at least one sort key is required"));
    }
    for key in keys {
        schema
            .field_with_name(&key.column)
            .map_err(|_| RivuletError::column_not_found(key.column.clone()))?;
    }
    Ok(())
}

/// Sort `batch` by `keys`, keeping only the first `limit` rows if given.
pub(crate) fn sort_batch(
    batch: &RecordBatch,
    keys: &[SortKey],
    nulls: NullPlacement,
    limit: Option<usize>,
) -> RivuletResult<RecordBatch> {
    if batch.num_rows() == 0 {
        return Ok(batch.clone());
    }
    let columns = keys
        .iter()
        .map(|key| {
            let values = batch
                .column_by_name(&key.column)
                .cloned()
                .ok_or_else(|| RivuletError::column_not_found(key.column.clone()))?;
            Ok(SortColumn {
                values,
                options: Some(SortOptions {
                    descending: key.order == SortOrder::Descending,
                    nulls_first: nulls == NullPlacement::AtStart,
                }),
            })
        })
        .collect::<RivuletResult<Vec<_>>>()?;
    let indices = lexsort_to_indices(&columns, limit)?;
    Ok(take_record_batch(batch, &indices)?)
}

/// Input-side state of a sorting sink.
pub(crate) trait SortAccumulator: Send + fmt::Debug + 'static {
    fn add(&mut self, batch: RecordBatch) -> RivuletResult<()>;

    /// All accumulated rows in final order.
    fn finish(&mut self) -> RivuletResult<RecordBatch>;

    /// Bytes currently held.
    fn size(&self) -> usize;

    fn describe(&self) -> String;
}

#[derive(Debug)]
struct SortState<A> {
    accumulator: A,
    reservation: MemoryReservation,
}

/// Accumulates all input, then delivers it sorted through a sink output.
#[derive(Debug)]
pub(crate) struct SortingSink<A> {
    core: NodeCore,
    output: SinkOutput,
    state: Mutex<SortState<A>>,
    counter: BatchCounter,
}

impl<A: SortAccumulator> SortingSink<A> {
    fn accumulate(&self, batch: ExecBatch) -> RivuletResult<()> {
        let batch = batch.to_record_batch(self.core.schema().clone())?;
        let size = {
            let mut state = self.state.lock();
            state.accumulator.add(batch)?;
            let size = state.accumulator.size();
            state.reservation.try_resize(size)?;
            size
        };
        self.core.record_memory(size);
        Ok(())
    }

    fn finish(self: Arc<Self>) {
        let node = Arc::clone(&self);
        self.core.spawn(self.clone(), "sort-finish", async move {
            let sorted = {
                let mut state = node.state.lock();
                let sorted = state.accumulator.finish()?;
                state.reservation.free();
                sorted
            };
            let batch_size = node.core.ctx().batch_size().max(1);
            let mut offset = 0;
            while offset < sorted.num_rows() {
                let len = batch_size.min(sorted.num_rows() - offset);
                let chunk = ExecBatch::from_record_batch(&sorted.slice(offset, len));
                if !node.output.send(chunk) {
                    log::debug!("{} reader dropped; stopping", node.core.label());
                    node.stop_producing();
                    return Ok(());
                }
                offset += len;
            }
            node.output.close();
            node.core.mark_output_done();
            Ok(())
        });
    }
}

impl<A: SortAccumulator> ExecNode for SortingSink<A> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::blocking()
    }

    fn describe(&self) -> Option<String> {
        Some(self.state.lock().accumulator.describe())
    }

    fn input_received(self: Arc<Self>, _input: NodeId, batch: ExecBatch) {
        if self.core.is_halted() {
            return;
        }
        self.core.record_input(batch.num_rows());
        let node = Arc::clone(&self);
        self.core.spawn(self.clone(), "sort-accumulate", async move {
            node.accumulate(batch)?;
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

    fn error_received(&self, _input: NodeId, error: RivuletError) {
        self.output.send_error(error.clone());
        self.core.fail(error);
    }

    fn task_failed(&self, error: RivuletError) {
        self.output.send_error(error.clone());
        self.core.fail(error);
    }

    fn stop_producing(&self) {
        self.core.stop();
        self.output.close();
    }
}

/// Add a sorting sink consuming `input`.
pub(crate) fn add_sorting_sink<A, F>(
    plan: &ExecPlan,
    kind: &'static str,
    input: NodeId,
    output: SinkOutput,
    build: F,
) -> RivuletResult<NodeId>
where
    A: SortAccumulator,
    F: FnOnce(SchemaRef) -> A,
{
    let schema = plan.output_schema(input)?;
    output.set_schema(schema.clone());
    let accumulator = build(schema.clone());
    let memory = Arc::clone(plan.context().memory());
    plan.add_node(NodeSpec::sink(kind, vec![input], schema), |core| {
        let reservation = MemoryReservation::new(memory, core.label());
        Ok(SortingSink {
            core,
            output,
            state: Mutex::new(SortState {
                accumulator,
                reservation,
            }),
            counter: BatchCounter::new(),
        })
    })
}

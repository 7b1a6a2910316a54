//! Grouped aggregation.
//!
//! Group keys are encoded with the Arrow row format; the encoded bytes
//! index an ahash map from key to a dense group id, and each aggregate's
//! accumulator keeps one slot per group id. Output is produced once every
//! input batch has been folded in, one `batch_size` chunk per task, and
//! stops while the consumer holds a pause.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::ArrayRef;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use common_error::{RivuletError, RivuletResult};

use super::chunked::ChunkedOutput;
use crate::batch::ExecBatch;
use crate::functions::{AggregateOptions, GroupsAccumulator};
use crate::memory::MemoryReservation;
use crate::node::{BatchCounter, ExecNode, NodeCaps, NodeCore, NodeId, NodeSpec, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

/// One aggregate computed per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Name in the function registry.
    pub function: String,
    /// Input column; `None` only for `count`, which then counts rows.
    pub target: Option<String>,
    /// Output column name.
    pub name: String,
    #[serde(default)]
    pub options: AggregateOptions,
}

impl Aggregate {
    pub fn new(
        function: impl Into<String>,
        target: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            function: function.into(),
            target: Some(target.into()),
            name: name.into(),
            options: AggregateOptions::None,
        }
    }

    /// `count` over every row.
    pub fn count_all(name: impl Into<String>) -> Self {
        Self {
            function: "count".to_string(),
            target: None,
            name: name.into(),
            options: AggregateOptions::None,
        }
    }

    pub fn with_options(mut self, options: AggregateOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target.as_deref().unwrap_or("*");
        write!(f, "{}({target}) AS {}", self.function, self.name)
    }
}

/// Options for the `aggregate` factory. No keys means a scalar aggregate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateNodeOptions {
    pub keys: Vec<String>,
    pub aggregates: Vec<Aggregate>,
}

impl AggregateNodeOptions {
    pub fn new(keys: Vec<String>, aggregates: Vec<Aggregate>) -> Self {
        Self { keys, aggregates }
    }
}

/// Maps encoded keys to dense group ids.
struct Grouper {
    converter: RowConverter,
    groups: Rows,
    map: AHashMap<Box<[u8]>, usize>,
}

impl Grouper {
    fn new(fields: Vec<SortField>) -> RivuletResult<Self> {
        let converter = RowConverter::new(fields)?;
        let groups = converter.empty_rows(0, 0);
        Ok(Self {
            converter,
            groups,
            map: AHashMap::new(),
        })
    }

    fn group_indices(&mut self, keys: &[ArrayRef]) -> RivuletResult<Vec<usize>> {
        let rows = self.converter.convert_columns(keys)?;
        let mut indices = Vec::with_capacity(rows.num_rows());
        for row in rows.iter() {
            let index = match self.map.get(row.as_ref()) {
                Some(&index) => index,
                None => {
                    let index = self.groups.num_rows();
                    self.groups.push(row);
                    self.map.insert(row.as_ref().into(), index);
                    index
                }
            };
            indices.push(index);
        }
        Ok(indices)
    }

    fn num_groups(&self) -> usize {
        self.groups.num_rows()
    }

    fn keys(&self) -> RivuletResult<Vec<ArrayRef>> {
        Ok(self.converter.convert_rows(self.groups.iter())?)
    }

    fn size(&self) -> usize {
        self.converter.size()
            + self.groups.size()
            + self.map.capacity() * std::mem::size_of::<(Box<[u8]>, usize)>()
            + self.map.keys().map(|k| k.len()).sum::<usize>()
    }
}

struct AggregateState {
    /// `None` for a scalar aggregate, which has exactly one group.
    grouper: Option<Grouper>,
    accumulators: Vec<Box<dyn GroupsAccumulator>>,
    reservation: MemoryReservation,
}

impl AggregateState {
    fn num_groups(&self) -> usize {
        self.grouper.as_ref().map_or(1, Grouper::num_groups)
    }

    fn size(&self) -> usize {
        self.grouper.as_ref().map_or(0, Grouper::size)
            + self.accumulators.iter().map(|a| a.size()).sum::<usize>()
    }
}

pub struct AggregateNode {
    core: NodeCore,
    input_schema: SchemaRef,
    key_columns: Vec<usize>,
    target_columns: Vec<Option<usize>>,
    aggregates: Vec<Aggregate>,
    state: Mutex<AggregateState>,
    counter: BatchCounter,
    output: Arc<ChunkedOutput>,
}

impl fmt::Debug for AggregateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateNode")
            .field("core", &self.core)
            .field("key_columns", &self.key_columns)
            .field("aggregates", &self.aggregates)
            .finish_non_exhaustive()
    }
}

impl AggregateNode {
    fn update(&self, batch: ExecBatch) -> RivuletResult<()> {
        let batch = batch.to_record_batch(self.input_schema.clone())?;
        let keys: Vec<ArrayRef> = self
            .key_columns
            .iter()
            .map(|&i| Arc::clone(batch.column(i)))
            .collect();
        let targets: Vec<Option<ArrayRef>> = self
            .target_columns
            .iter()
            .map(|t| t.map(|i| Arc::clone(batch.column(i))))
            .collect();

        let size = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let group_indices = match state.grouper.as_mut() {
                Some(grouper) => grouper.group_indices(&keys)?,
                None => vec![0; batch.num_rows()],
            };
            let total_groups = state.num_groups();
            for (accumulator, values) in state.accumulators.iter_mut().zip(&targets) {
                accumulator.update(values.as_ref(), &group_indices, total_groups)?;
            }
            let size = state.size();
            state.reservation.try_resize(size)?;
            size
        };
        self.core.record_memory(size);
        Ok(())
    }

    fn finalize(&self) -> RivuletResult<RecordBatch> {
        let mut state = self.state.lock();
        let total_groups = state.num_groups();
        let mut columns = match &state.grouper {
            Some(grouper) => grouper.keys()?,
            None => Vec::new(),
        };
        for accumulator in &mut state.accumulators {
            columns.push(accumulator.evaluate(total_groups)?);
        }
        state.grouper = None;
        state.reservation.free();
        Ok(RecordBatch::try_new(self.core.schema().clone(), columns)?)
    }

    fn emit_output(self: &Arc<Self>) -> RivuletResult<()> {
        let output = self.finalize()?;
        log::debug!("{} produced {} groups", self.core.label(), output.num_rows());
        self.output.load(
            Arc::clone(self) as Arc<dyn ExecNode>,
            vec![output],
            self.core.ctx().batch_size(),
        );
        Ok(())
    }
}

impl ExecNode for AggregateNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::blocking()
    }

    fn describe(&self) -> Option<String> {
        let aggregates: Vec<String> = self.aggregates.iter().map(ToString::to_string).collect();
        let keys: Vec<&str> = self
            .key_columns
            .iter()
            .map(|&i| self.input_schema.field(i).name().as_str())
            .collect();
        Some(format!("keys=[{}], {}", keys.join(", "), aggregates.join(", ")))
    }

    fn input_received(self: Arc<Self>, _input: NodeId, batch: ExecBatch) {
        if self.core.is_halted() {
            return;
        }
        self.core.record_input(batch.num_rows());
        let node = Arc::clone(&self);
        self.core.spawn(self.clone(), "aggregate-update", async move {
            node.update(batch)?;
            if node.counter.increment() {
                node.emit_output()?;
            }
            Ok(())
        });
    }

    fn input_finished(self: Arc<Self>, _input: NodeId, total: u64) {
        if self.counter.set_total(total) {
            let node = Arc::clone(&self);
            self.core
                .spawn(self.clone(), "aggregate-finish", async move { node.emit_output() });
        }
    }

    // input is folded in as it arrives; only the emission of results waits
    fn pause_producing(&self, output: NodeId, counter: u64) {
        let paused = self.output.pause(output, counter);
        self.core.set_paused(paused);
    }

    fn resume_producing(self: Arc<Self>, output: NodeId, counter: u64) {
        let node = Arc::clone(&self) as Arc<dyn ExecNode>;
        let paused = self.output.resume(node, output, counter);
        self.core.set_paused(paused);
    }

    fn stop_producing(&self) {
        self.core.stop();
        self.output.clear();
    }
}

fn column_index(schema: &Schema, name: &str) -> RivuletResult<usize> {
    schema
        .index_of(name)
        .map_err(|_| RivuletError::column_not_found(name.to_string()))
}

/// Factory for `aggregate`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("aggregate", &inputs, 1)?;
    let options = downcast_options::<AggregateNodeOptions>(options, "aggregate")?;
    if options.keys.is_empty() && options.aggregates.is_empty() {
        return Err(RivuletError::invalid_options(
            "aggregate needs at least one key or aggregate",
        ));
    }
    let input_schema = plan.output_schema(inputs[0])?;
    let functions = plan.context().functions();

    let mut fields = Vec::new();
    let mut key_columns = Vec::new();
    for key in &options.keys {
        let index = column_index(&input_schema, key)?;
        key_columns.push(index);
        fields.push(input_schema.field(index).clone());
    }

    let mut target_columns = Vec::new();
    let mut accumulators = Vec::new();
    for aggregate in &options.aggregates {
        let function = functions.aggregate(&aggregate.function)?;
        let target = aggregate
            .target
            .as_deref()
            .map(|name| column_index(&input_schema, name))
            .transpose()?;
        let input_type = target.map(|i| input_schema.field(i).data_type());
        if input_type.is_none() && aggregate.function != "count" {
            return Err(RivuletError::invalid_options(format!(
                "{} requires a target column",
                aggregate.function
            )));
        }
        let return_type = function.return_type(input_type, &aggregate.options)?;
        accumulators.push(function.accumulator(input_type, &aggregate.options)?);
        target_columns.push(target);
        fields.push(Field::new(&aggregate.name, return_type, true));
    }
    let mut names = std::collections::HashSet::new();
    if let Some(duplicate) = fields.iter().find(|f| !names.insert(f.name().clone())) {
        return Err(RivuletError::invalid_options(format!(
            "aggregate output column '{}' appears twice",
            duplicate.name()
        )));
    }
    let schema = Arc::new(Schema::new(fields));

    let grouper = if key_columns.is_empty() {
        None
    } else {
        let sort_fields = key_columns
            .iter()
            .map(|&i| SortField::new(input_schema.field(i).data_type().clone()))
            .collect();
        Some(Grouper::new(sort_fields)?)
    };
    let memory = Arc::clone(plan.context().memory());

    let spec = NodeSpec::new("aggregate", inputs, schema);
    plan.add_node(spec, |core| {
        let reservation = MemoryReservation::new(memory, core.label());
        Ok(AggregateNode {
            core,
            input_schema,
            key_columns,
            target_columns,
            aggregates: options.aggregates,
            state: Mutex::new(AggregateState {
                grouper,
                accumulators,
                reservation,
            }),
            counter: BatchCounter::new(),
            output: Arc::new(ChunkedOutput::new()),
        })
    })
}

//! Hash join.
//!
//! Input 0 is the build (left) side and input 1 the probe (right) side.
//! The node moves through four phases:
//!
//! ```text
//! Building ──table built──▶ Probing ──probe exhausted──▶ Draining ──▶ Finished
//! ```
//!
//! Probe batches that arrive while the table is still being built are
//! queued. A backpressure controller meters the queue and pauses the probe
//! input above its high watermark; pauses from downstream are merged with
//! it in a [`ProbeGate`] so the probe producer sees a single requester.
//! The build side is never paused. Downstream pauses also hold back the
//! rows owed at the end (outer, semi and anti joins), which are emitted
//! one chunk per task.

mod table;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use common_error::{RivuletError, RivuletResult};

use self::table::{JoinLayout, JoinTable};
use super::chunked::ChunkedOutput;
use crate::backpressure::{BackpressureController, BackpressureOptions, BackpressureTarget, PauseSet};
use crate::batch::ExecBatch;
use crate::expr::{Expr, ExprEvaluator, common_type};
use crate::memory::MemoryReservation;
use crate::node::{BatchCounter, ExecNode, NodeCaps, NodeCore, NodeId, NodeSpec, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, PlanShared, downcast_options};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    LeftAnti,
    RightSemi,
    RightAnti,
}

impl JoinType {
    /// Whether build rows must remember if they ever matched.
    fn tracks_build_matches(self) -> bool {
        matches!(
            self,
            Self::LeftOuter | Self::FullOuter | Self::LeftSemi | Self::LeftAnti
        )
    }

    fn outputs_left(self) -> bool {
        !matches!(self, Self::RightSemi | Self::RightAnti)
    }

    fn outputs_right(self) -> bool {
        !matches!(self, Self::LeftSemi | Self::LeftAnti)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inner => "inner",
            Self::LeftOuter => "left outer",
            Self::RightOuter => "right outer",
            Self::FullOuter => "full outer",
            Self::LeftSemi => "left semi",
            Self::LeftAnti => "left anti",
            Self::RightSemi => "right semi",
            Self::RightAnti => "right anti",
        };
        f.write_str(name)
    }
}

/// How nulls compare in one key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKeyCmp {
    /// Nulls never match.
    #[default]
    Eq,
    /// Null matches null.
    Is,
}

/// Options for the `hashjoin` factory.
#[derive(Debug, Clone)]
pub struct HashJoinNodeOptions {
    pub join_type: JoinType,
    pub left_keys: Vec<String>,
    pub right_keys: Vec<String>,
    /// One per key; empty means `Eq` for every key.
    pub key_cmp: Vec<JoinKeyCmp>,
    /// Residual predicate over candidate pairs.
    pub filter: Option<Expr>,
    /// Left columns to output; all by default.
    pub left_output: Option<Vec<String>>,
    pub right_output: Option<Vec<String>>,
    pub left_suffix: String,
    pub right_suffix: String,
    /// Flow control for probe batches queued during the build.
    pub backpressure: Option<BackpressureOptions>,
}

impl HashJoinNodeOptions {
    pub fn new(join_type: JoinType, left_keys: Vec<String>, right_keys: Vec<String>) -> Self {
        Self {
            join_type,
            left_keys,
            right_keys,
            key_cmp: Vec::new(),
            filter: None,
            left_output: None,
            right_output: None,
            left_suffix: "_l".to_string(),
            right_suffix: "_r".to_string(),
            backpressure: None,
        }
    }

    pub fn with_key_cmp(mut self, key_cmp: Vec<JoinKeyCmp>) -> Self {
        self.key_cmp = key_cmp;
        self
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_left_output(mut self, columns: Vec<String>) -> Self {
        self.left_output = Some(columns);
        self
    }

    pub fn with_right_output(mut self, columns: Vec<String>) -> Self {
        self.right_output = Some(columns);
        self
    }

    pub fn with_suffixes(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.left_suffix = left.into();
        self.right_suffix = right.into();
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureOptions) -> Self {
        self.backpressure = Some(backpressure);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPhase {
    Building,
    Probing,
    Draining,
    Finished,
}

#[derive(Debug, Default)]
struct GateState {
    pauses: PauseSet,
    forwarded: bool,
    counter: u64,
}

/// Merges pause requests for the probe input: one from the join's own
/// queue and one per downstream consumer.
struct ProbeGate {
    plan: Weak<PlanShared>,
    join: NodeId,
    probe: NodeId,
    state: Mutex<GateState>,
}

impl ProbeGate {
    fn update(&self, requester: NodeId, counter: u64, paused: bool) {
        let mut state = self.state.lock();
        let applied = if paused {
            state.pauses.pause(requester, counter)
        } else {
            state.pauses.resume(requester, counter)
        };
        let now = state.pauses.is_paused();
        if !applied || now == state.forwarded {
            return;
        }
        state.forwarded = now;
        state.counter += 1;
        let counter = state.counter;
        let Some(probe) = self.plan.upgrade().and_then(|p| p.node(self.probe)) else {
            return;
        };
        if now {
            log::trace!("pausing probe input {}", self.probe);
            probe.pause_producing(self.join, counter);
        } else {
            log::trace!("resuming probe input {}", self.probe);
            probe.resume_producing(self.join, counter);
        }
    }
}

impl BackpressureTarget for ProbeGate {
    fn pause(&self, counter: u64) {
        self.update(self.join, counter, true);
    }

    fn resume(&self, counter: u64) {
        self.update(self.join, counter, false);
    }
}

#[derive(Debug)]
struct JoinState {
    phase: JoinPhase,
    build_batches: Vec<arrow::record_batch::RecordBatch>,
    reservation: MemoryReservation,
    table: Option<Arc<JoinTable>>,
    /// Probe batches received during the build, with their metered size.
    queued: Vec<(ExecBatch, u64)>,
}

pub struct HashJoinNode {
    core: NodeCore,
    layout: Arc<JoinLayout>,
    right_schema: SchemaRef,
    gate: Arc<ProbeGate>,
    queue: BackpressureController,
    state: Mutex<JoinState>,
    build_counter: BatchCounter,
    probe_counter: BatchCounter,
    drain: Arc<ChunkedOutput>,
}

impl fmt::Debug for HashJoinNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashJoinNode")
            .field("core", &self.core)
            .field("join_type", &self.layout.join_type)
            .field("phase", &self.state.lock().phase)
            .finish_non_exhaustive()
    }
}

impl HashJoinNode {
    fn is_build_input(&self, input: NodeId) -> bool {
        self.core.inputs()[0] == input
    }

    fn accumulate_build(self: &Arc<Self>, batch: ExecBatch) -> RivuletResult<()> {
        let batch = batch.to_record_batch(self.layout.left_schema.clone())?;
        let reserved = {
            let mut state = self.state.lock();
            state.reservation.try_grow(batch.get_array_memory_size())?;
            state.build_batches.push(batch);
            state.reservation.size()
        };
        self.core.record_memory(reserved);
        if self.build_counter.increment() {
            self.start_build();
        }
        Ok(())
    }

    fn start_build(self: &Arc<Self>) {
        let node = Arc::clone(self);
        self.core
            .spawn(Arc::clone(self) as Arc<dyn ExecNode>, "hashjoin-build", async move {
                node.build()
            });
    }

    fn build(self: &Arc<Self>) -> RivuletResult<()> {
        let batches = std::mem::take(&mut self.state.lock().build_batches);
        let build = concat_batches(&self.layout.left_schema, &batches)?;
        drop(batches);
        let table = Arc::new(JoinTable::build(Arc::clone(&self.layout), build)?);
        log::debug!("{} built table over {} rows", self.core.label(), table.num_rows());

        let queued = {
            let mut state = self.state.lock();
            state.reservation.try_resize(table.size())?;
            state.table = Some(Arc::clone(&table));
            state.phase = JoinPhase::Probing;
            let queued = std::mem::take(&mut state.queued);
            let released: u64 = queued.iter().map(|(_, amount)| amount).sum();
            self.queue.record_removed(released);
            queued
        };
        self.core.record_memory(table.size());

        for (batch, _) in queued {
            self.probe(&table, batch)?;
        }
        self.maybe_drain();
        Ok(())
    }

    fn probe(self: &Arc<Self>, table: &JoinTable, batch: ExecBatch) -> RivuletResult<()> {
        let batch = batch.to_record_batch(self.right_schema.clone())?;
        if let Some(output) = table.probe(&batch, self.core.ctx().functions())? {
            if output.num_rows() > 0 {
                self.core.emit(ExecBatch::from_record_batch(&output));
            }
        }
        if self.probe_counter.increment() {
            self.maybe_drain();
        }
        Ok(())
    }

    /// Emit owed build rows once the table exists and the probe is done.
    fn maybe_drain(self: &Arc<Self>) {
        let table = {
            let mut state = self.state.lock();
            if state.phase != JoinPhase::Probing || !self.probe_counter.is_complete() {
                return;
            }
            state.phase = JoinPhase::Draining;
            state.table.clone()
        };
        let Some(table) = table else {
            return;
        };
        let node = Arc::clone(self);
        self.core
            .spawn(Arc::clone(self) as Arc<dyn ExecNode>, "hashjoin-drain", async move {
                let batch_size = node.core.ctx().batch_size();
                let owed = table.drain(batch_size)?;
                drop(table);
                {
                    let mut state = node.state.lock();
                    state.phase = JoinPhase::Finished;
                    state.table = None;
                    state.reservation.free();
                }
                log::debug!(
                    "{} owes {} rows after probing",
                    node.core.label(),
                    owed.iter().map(|b| b.num_rows()).sum::<usize>()
                );
                let owner = Arc::clone(&node) as Arc<dyn ExecNode>;
                node.drain.load(owner, owed, batch_size);
                Ok(())
            });
    }
}

impl ExecNode for HashJoinNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::blocking()
    }

    fn describe(&self) -> Option<String> {
        let left = self.layout.left_schema.fields();
        let right = self.right_schema.fields();
        let keys: Vec<String> = self
            .layout
            .left_keys
            .iter()
            .zip(&self.layout.right_keys)
            .map(|(&l, &r)| format!("{} = {}", left[l].name(), right[r].name()))
            .collect();
        let mut description = format!("{}: {}", self.layout.join_type, keys.join(", "));
        if let Some(filter) = &self.layout.filter {
            description.push_str(&format!(" if {filter}"));
        }
        Some(description)
    }

    fn input_received(self: Arc<Self>, input: NodeId, batch: ExecBatch) {
        if self.core.is_halted() {
            return;
        }
        self.core.record_input(batch.num_rows());
        if self.is_build_input(input) {
            if let Err(e) = self.accumulate_build(batch) {
                self.core.fail(e);
            }
            return;
        }

        let table = {
            let mut state = self.state.lock();
            match &state.table {
                Some(table) => Arc::clone(table),
                None => {
                    let amount = self.queue.options().measure(&batch);
                    state.queued.push((batch, amount));
                    self.queue.record_added(amount);
                    return;
                }
            }
        };
        let node = Arc::clone(&self);
        self.core.spawn(self.clone(), "hashjoin-probe", async move {
            node.probe(&table, batch)
        });
    }

    fn input_finished(self: Arc<Self>, input: NodeId, total: u64) {
        if self.is_build_input(input) {
            if self.build_counter.set_total(total) {
                self.start_build();
            }
        } else if self.probe_counter.set_total(total) {
            self.maybe_drain();
        }
    }

    fn pause_producing(&self, output: NodeId, counter: u64) {
        self.gate.update(output, counter, true);
        let paused = self.drain.pause(output, counter);
        self.core.set_paused(paused);
    }

    fn resume_producing(self: Arc<Self>, output: NodeId, counter: u64) {
        self.gate.update(output, counter, false);
        let node = Arc::clone(&self) as Arc<dyn ExecNode>;
        let paused = self.drain.resume(node, output, counter);
        self.core.set_paused(paused);
    }

    fn stop_producing(&self) {
        self.core.stop();
        self.drain.clear();
        let mut state = self.state.lock();
        state.queued.clear();
        state.build_batches.clear();
        state.table = None;
        state.reservation.free();
    }
}

fn resolve_columns(schema: &Schema, names: &[String]) -> RivuletResult<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            schema
                .index_of(name)
                .map_err(|_| RivuletError::column_not_found(name.clone()))
        })
        .collect()
}

/// Fields named so that names present on both sides get the side's suffix.
fn suffixed_fields(
    left: &[Field],
    right: &[Field],
    left_suffix: &str,
    right_suffix: &str,
) -> Vec<Field> {
    let left_names: HashSet<&str> = left.iter().map(|f| f.name().as_str()).collect();
    let right_names: HashSet<&str> = right.iter().map(|f| f.name().as_str()).collect();
    let rename = |field: &Field, others: &HashSet<&str>, suffix: &str| {
        if others.contains(field.name().as_str()) {
            field.clone().with_name(format!("{}{suffix}", field.name()))
        } else {
            field.clone()
        }
    };
    left.iter()
        .map(|f| rename(f, &right_names, left_suffix))
        .chain(right.iter().map(|f| rename(f, &left_names, right_suffix)))
        .collect()
}

fn build_layout(
    options: &HashJoinNodeOptions,
    left_schema: &SchemaRef,
    right_schema: &SchemaRef,
    evaluator: ExprEvaluator<'_>,
) -> RivuletResult<JoinLayout> {
    let join_type = options.join_type;
    if options.left_keys.is_empty() || options.left_keys.len() != options.right_keys.len() {
        return Err(RivuletError::invalid_options(format!(
            "hash join needs matching non-empty key lists, got {} left and {} right",
            options.left_keys.len(),
            options.right_keys.len()
        )));
    }
    let null_equal = match options.key_cmp.len() {
        0 => vec![false; options.left_keys.len()],
        n if n == options.left_keys.len() => {
            options.key_cmp.iter().map(|c| *c == JoinKeyCmp::Is).collect()
        }
        n => {
            return Err(RivuletError::invalid_options(format!(
                "{n} key comparisons for {} keys",
                options.left_keys.len()
            )));
        }
    };

    let left_keys = resolve_columns(left_schema, &options.left_keys)?;
    let right_keys = resolve_columns(right_schema, &options.right_keys)?;
    let key_types = left_keys
        .iter()
        .zip(&right_keys)
        .map(|(&l, &r)| {
            let lt = left_schema.field(l).data_type();
            let rt = right_schema.field(r).data_type();
            common_type(lt, rt).ok_or_else(|| {
                RivuletError::type_error(format!(
                    "cannot join {} ({lt}) with {} ({rt})",
                    left_schema.field(l).name(),
                    right_schema.field(r).name()
                ))
            })
        })
        .collect::<RivuletResult<Vec<DataType>>>()?;

    let left_output = match (&options.left_output, join_type.outputs_left()) {
        (_, false) => Vec::new(),
        (Some(names), true) => resolve_columns(left_schema, names)?,
        (None, true) => (0..left_schema.fields().len()).collect(),
    };
    let right_output = match (&options.right_output, join_type.outputs_right()) {
        (_, false) => Vec::new(),
        (Some(names), true) => resolve_columns(right_schema, names)?,
        (None, true) => (0..right_schema.fields().len()).collect(),
    };

    let left_nullable = matches!(join_type, JoinType::RightOuter | JoinType::FullOuter);
    let right_nullable = matches!(join_type, JoinType::LeftOuter | JoinType::FullOuter);
    let left_fields: Vec<Field> = left_output
        .iter()
        .map(|&i| {
            let field = left_schema.field(i).clone();
            let nullable = field.is_nullable() || left_nullable;
            field.with_nullable(nullable)
        })
        .collect();
    let right_fields: Vec<Field> = right_output
        .iter()
        .map(|&i| {
            let field = right_schema.field(i).clone();
            let nullable = field.is_nullable() || right_nullable;
            field.with_nullable(nullable)
        })
        .collect();
    let output_schema = Arc::new(Schema::new(suffixed_fields(
        &left_fields,
        &right_fields,
        &options.left_suffix,
        &options.right_suffix,
    )));

    let all_left: Vec<Field> = left_schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();
    let all_right: Vec<Field> = right_schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();
    let filter_schema = Arc::new(Schema::new(suffixed_fields(
        &all_left,
        &all_right,
        &options.left_suffix,
        &options.right_suffix,
    )));
    if let Some(filter) = &options.filter {
        let filter_type = evaluator.data_type(filter, &filter_schema)?;
        if filter_type != DataType::Boolean {
            return Err(RivuletError::type_error(format!(
                "join filter {filter} has type {filter_type}, expected Boolean"
            )));
        }
    }

    let mut seen = HashSet::new();
    for field in output_schema.fields() {
        if !seen.insert(field.name().as_str()) {
            return Err(RivuletError::invalid_options(format!(
                "join output column '{}' is ambiguous after suffixing",
                field.name()
            )));
        }
    }

    Ok(JoinLayout {
        join_type,
        left_keys,
        right_keys,
        key_types,
        null_equal,
        left_schema: Arc::clone(left_schema),
        left_output,
        right_output,
        output_schema,
        filter: options.filter.clone(),
        filter_schema,
    })
}

/// Factory for `hashjoin`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("hashjoin", &inputs, 2)?;
    let options = downcast_options::<HashJoinNodeOptions>(options, "hashjoin")?;
    let (build_input, probe_input) = (inputs[0], inputs[1]);
    let left_schema = plan.output_schema(build_input)?;
    let right_schema = plan.output_schema(probe_input)?;
    let ctx = plan.context();
    let layout = Arc::new(build_layout(
        &options,
        &left_schema,
        &right_schema,
        ExprEvaluator::new(ctx.functions()),
    )?);
    let backpressure = match options.backpressure {
        Some(backpressure) => backpressure,
        None => BackpressureOptions::from_config(&ctx.config().backpressure)?,
    };
    let memory = Arc::clone(ctx.memory());

    let spec = NodeSpec::new("hashjoin", inputs, layout.output_schema.clone());
    plan.add_node(spec, |core| {
        let gate = Arc::new(ProbeGate {
            plan: core.plan().clone(),
            join: core.id(),
            probe: probe_input,
            state: Mutex::new(GateState::default()),
        });
        let queue = BackpressureController::new(backpressure, gate.clone());
        let reservation = MemoryReservation::new(memory, core.label());
        Ok(HashJoinNode {
            core,
            layout,
            right_schema,
            gate,
            queue,
            state: Mutex::new(JoinState {
                phase: JoinPhase::Building,
                build_batches: Vec::new(),
                reservation,
                table: None,
                queued: Vec::new(),
            }),
            build_counter: BatchCounter::new(),
            probe_counter: BatchCounter::new(),
            drain: Arc::new(ChunkedOutput::new()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::expr::{col, lit};

    fn schema(fields: &[(&str, DataType, bool)]) -> SchemaRef {
        Arc::new(Schema::new(
            fields
                .iter()
                .map(|(n, t, null)| Field::new(*n, t.clone(), *null))
                .collect::<Vec<_>>(),
        ))
    }

    fn names(schema: &SchemaRef) -> Vec<String> {
        schema.fields().iter().map(|f| f.name().clone()).collect()
    }

    #[test]
    fn test_layout_suffixes_and_nullability() {
        let registry = FunctionRegistry::with_builtins();
        let left = schema(&[("id", DataType::Int64, false), ("v", DataType::Utf8, false)]);
        let right = schema(&[("id", DataType::Int32, false), ("w", DataType::Utf8, false)]);
        let options = HashJoinNodeOptions::new(
            JoinType::LeftOuter,
            vec!["id".into()],
            vec!["id".into()],
        );
        let layout = build_layout(&options, &left, &right, ExprEvaluator::new(&registry)).unwrap();

        assert_eq!(names(&layout.output_schema), vec!["id_l", "v", "id_r", "w"]);
        assert!(!layout.output_schema.field(0).is_nullable());
        assert!(layout.output_schema.field(2).is_nullable());
        assert_eq!(layout.key_types, vec![DataType::Int64]);
    }

    #[test]
    fn test_layout_semi_outputs_one_side() {
        let registry = FunctionRegistry::with_builtins();
        let left = schema(&[("id", DataType::Int64, false)]);
        let right = schema(&[("id", DataType::Int64, false), ("w", DataType::Utf8, true)]);
        let options =
            HashJoinNodeOptions::new(JoinType::RightSemi, vec!["id".into()], vec!["id".into()]);
        let layout = build_layout(&options, &left, &right, ExprEvaluator::new(&registry)).unwrap();
        assert_eq!(names(&layout.output_schema), vec!["id", "w"]);
    }

    #[test]
    fn test_layout_rejects_bad_options() {
        let registry = FunctionRegistry::with_builtins();
        let evaluator = ExprEvaluator::new(&registry);
        let left = schema(&[("id", DataType::Int64, false)]);
        let right = schema(&[("name", DataType::Utf8, false)]);

        let mismatched =
            HashJoinNodeOptions::new(JoinType::Inner, vec!["id".into()], vec![]);
        assert!(build_layout(&mismatched, &left, &right, evaluator).is_err());

        let incompatible =
            HashJoinNodeOptions::new(JoinType::Inner, vec!["id".into()], vec!["name".into()]);
        let err = build_layout(&incompatible, &left, &right, evaluator).unwrap_err();
        assert!(matches!(err, RivuletError::TypeError(_)));

        let bad_filter =
            HashJoinNodeOptions::new(JoinType::Inner, vec!["id".into()], vec!["id".into()])
                .with_filter(col("id").add(lit(1i64)));
        let right = schema(&[("id", DataType::Int64, false)]);
        assert!(build_layout(&bad_filter, &left, &right, evaluator).is_err());
    }
}

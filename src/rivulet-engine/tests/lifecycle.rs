//! Plan lifecycle tests: backpressure, stopping, cancellation and error
//! propagation.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use arrow::array::{ArrayRef, BooleanArray, Int64Array};
use arrow::datatypes::{DataType, SchemaRef};
use async_trait::async_trait;

use common_config::{BackpressureUnit, RivuletConfig};
use common_error::{RivuletError, RivuletResult};
use rivulet_engine::expr::{call, col, lit};
use rivulet_engine::operators::{
    Aggregate, AggregateNodeOptions, ConsumingSinkNodeOptions, FilterNodeOptions,
    HashJoinNodeOptions, JoinType, SinkConsumer, SinkNodeOptions, SinkReader,
    SourceNodeOptions, TableSourceNodeOptions,
};
use rivulet_engine::{
    BackpressureControl, BackpressureOptions, CancellationHandle, Declaration, ExecBatch,
    ExecContext, ExecNode, ExecPlan, FunctionRegistry, LocalExecutor, MetricsSink, NodeCore,
    NodeId, NodeSpec, NodeState,
};

use common::*;

fn stream_source(batches: usize, delay: Duration) -> Declaration {
    Declaration::new(
        "source",
        SourceNodeOptions::new(id_schema(), delayed_stream(id_batches(batches, 10), delay)),
    )
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_reader_pauses_source() {
    let (ctx, metrics) = context();
    let plan = ExecPlan::new(ctx);
    let backpressure = BackpressureOptions::new(2, 4, BackpressureUnit::Batches).unwrap();
    let (sink_options, mut reader) = SinkNodeOptions::new();
    let source = Declaration::new(
        "source",
        SourceNodeOptions::from_batches(
            id_schema(),
            id_batches(100, 10)
                .iter()
                .map(ExecBatch::from_record_batch)
                .collect(),
        ),
    );
    Declaration::sequence(vec![
        source,
        Declaration::new("sink", sink_options.with_backpressure(backpressure)),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();
    plan.start_producing().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let source = plan.node(NodeId::new(0)).unwrap();
    assert_eq!(source.core().state(), NodeState::Paused);
    // the fifth batch crosses the high watermark
    let produced = metrics.get("source#0").unwrap().batches_out;
    assert!((5..=6).contains(&produced), "produced {produced} batches");
    assert!(metrics.get("sink#1").unwrap().pauses >= 1);

    let mut ids = Vec::new();
    while let Some(batch) = reader.next().await.unwrap() {
        let batch = batch.to_record_batch(id_schema()).unwrap();
        ids.extend(int64_column(&batch, "id").into_iter().flatten());
    }
    assert_eq!(ids, (0..1000).collect::<Vec<_>>());
    plan.finished().await.unwrap();
    assert_eq!(metrics.get("source#0").unwrap().batches_out, 100);
}

/// Context whose pipeline breakers emit at most `batch_size` rows per batch.
fn small_batch_context(batch_size: usize) -> (ExecContext, MetricsSink) {
    let (ctx, metrics) = context();
    let mut config = RivuletConfig::default();
    config.execution = config.execution.with_batch_size(batch_size);
    (ctx.with_config(config), metrics)
}

/// Cap `input` with a sink that pauses above four buffered batches.
fn add_with_paced_sink(plan: &ExecPlan, input: Declaration) -> SinkReader {
    let backpressure = BackpressureOptions::new(2, 4, BackpressureUnit::Batches).unwrap();
    let (sink_options, reader) = SinkNodeOptions::new();
    Declaration::sequence(vec![
        input,
        Declaration::new("sink", sink_options.with_backpressure(backpressure)),
    ])
    .unwrap()
    .add_to_plan(plan)
    .unwrap();
    reader
}

async fn drain_ids(reader: &mut SinkReader) -> Vec<i64> {
    let schema = reader.schema().unwrap();
    let mut ids = Vec::new();
    while let Some(batch) = reader.next().await.unwrap() {
        let batch = batch.to_record_batch(schema.clone()).unwrap();
        ids.extend(int64_column(&batch, "id").into_iter().flatten());
    }
    ids.sort_unstable();
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paused_filter_reports_state() {
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    let pipeline = Declaration::sequence(vec![
        Declaration::new(
            "source",
            SourceNodeOptions::from_batches(
                id_schema(),
                id_batches(100, 10)
                    .iter()
                    .map(ExecBatch::from_record_batch)
                    .collect(),
            ),
        ),
        Declaration::new("filter", FilterNodeOptions::new(col("id").gt_eq(lit(0i64)))),
    ])
    .unwrap();
    let mut reader = add_with_paced_sink(&plan, pipeline);
    plan.start_producing().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let filter = plan.node(NodeId::new(1)).unwrap();
    assert_eq!(filter.core().state(), NodeState::Paused);
    assert_eq!(plan.node(NodeId::new(0)).unwrap().core().state(), NodeState::Paused);

    assert_eq!(drain_ids(&mut reader).await.len(), 1000);
    plan.finished().await.unwrap();
    assert_eq!(filter.core().state(), NodeState::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_reader_pauses_aggregate_output() {
    let (ctx, metrics) = small_batch_context(10);
    let plan = ExecPlan::new(ctx);
    let aggregate = Declaration::sequence(vec![
        Declaration::new(
            "table_source",
            TableSourceNodeOptions::new(id_schema(), id_batches(10, 100)),
        ),
        Declaration::new(
            "aggregate",
            AggregateNodeOptions::new(vec!["id".into()], vec![Aggregate::count_all("n")]),
        ),
    ])
    .unwrap();
    let mut reader = add_with_paced_sink(&plan, aggregate);
    plan.start_producing().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let node = plan.node(NodeId::new(1)).unwrap();
    assert_eq!(node.core().state(), NodeState::Paused);
    let emitted = metrics.get("aggregate#1").unwrap().batches_out;
    assert!((5..=6).contains(&emitted), "aggregate emitted {emitted} batches");
    assert!(metrics.get("sink#2").unwrap().pauses >= 1);

    assert_eq!(drain_ids(&mut reader).await, (0..1000).collect::<Vec<_>>());
    plan.finished().await.unwrap();
    assert_eq!(metrics.get("aggregate#1").unwrap().batches_out, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_reader_pauses_join_drain() {
    let (ctx, metrics) = small_batch_context(10);
    let plan = ExecPlan::new(ctx);
    let join = Declaration::new(
        "hashjoin",
        HashJoinNodeOptions::new(JoinType::LeftAnti, vec!["id".into()], vec!["id".into()]),
    )
    .with_inputs(vec![
        Declaration::new(
            "table_source",
            TableSourceNodeOptions::new(id_schema(), id_batches(10, 100)),
        ),
        Declaration::new("table_source", TableSourceNodeOptions::new(id_schema(), vec![])),
    ]);
    let mut reader = add_with_paced_sink(&plan, join);
    plan.start_producing().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let node = plan.node(NodeId::new(2)).unwrap();
    assert_eq!(node.core().state(), NodeState::Paused);
    let emitted = metrics.get("hashjoin#2").unwrap().batches_out;
    assert!((5..=6).contains(&emitted), "join emitted {emitted} batches");

    assert_eq!(drain_ids(&mut reader).await, (0..1000).collect::<Vec<_>>());
    plan.finished().await.unwrap();
    assert_eq!(metrics.get("hashjoin#2").unwrap().batches_out, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_pauses_probe_during_build() {
    let (ctx, metrics) = context();
    let plan = ExecPlan::new(ctx);
    let backpressure = BackpressureOptions::new(2, 4, BackpressureUnit::Batches).unwrap();
    let build = Declaration::new(
        "source",
        SourceNodeOptions::new(
            id_schema(),
            delayed_stream(id_batches(3, 10), Duration::from_millis(150)),
        ),
    );
    let probe = Declaration::new(
        "source",
        SourceNodeOptions::from_batches(
            id_schema(),
            id_batches(50, 10)
                .iter()
                .map(ExecBatch::from_record_batch)
                .collect(),
        ),
    );
    let join = Declaration::new(
        "hashjoin",
        HashJoinNodeOptions::new(JoinType::Inner, vec!["id".into()], vec!["id".into()])
            .with_backpressure(backpressure),
    )
    .with_inputs(vec![build, probe]);
    let (sink_options, reader) = SinkNodeOptions::new();
    Declaration::sequence(vec![join, Declaration::new("sink", sink_options)])
        .unwrap()
        .add_to_plan(&plan)
        .unwrap();
    plan.start_producing().unwrap();

    // the build side is still arriving; the fifth queued probe batch pauses it
    tokio::time::sleep(Duration::from_millis(200)).await;
    let probe = plan.node(NodeId::new(1)).unwrap();
    assert_eq!(probe.core().state(), NodeState::Paused);
    let produced = metrics.get("source#1").unwrap().batches_out;
    assert!((5..=6).contains(&produced), "probe produced {produced} batches");
    assert_eq!(metrics.get("hashjoin#2").map_or(0, |m| m.batches_out), 0);

    let batches = reader.collect().await.unwrap();
    assert_eq!(batches.iter().map(ExecBatch::num_rows).sum::<usize>(), 30);
    plan.finished().await.unwrap();
    assert_eq!(metrics.get("source#1").unwrap().batches_out, 50);
}

// =============================================================================
// Stopping and cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_stop_is_idempotent() {
    let (ctx, _) = context();
    let plan = Arc::new(ExecPlan::new(ctx));
    let (sink_options, _reader) = SinkNodeOptions::new();
    Declaration::sequence(vec![
        stream_source(10_000, Duration::from_millis(5)),
        Declaration::new("sink", sink_options),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();
    plan.start_producing().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let plan = Arc::clone(&plan);
            std::thread::spawn(move || plan.stop_producing())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    plan.stop_producing();

    tokio::time::timeout(Duration::from_secs(5), plan.finished())
        .await
        .expect("plan did not finish after stop")
        .unwrap();
    assert!(plan.is_stopped());
    for node in plan.nodes() {
        assert_eq!(node.core().state(), NodeState::Stopped);
    }
}

#[tokio::test]
async fn test_stop_before_start() {
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    let (sink_options, _reader) = SinkNodeOptions::new();
    Declaration::sequence(vec![
        stream_source(3, Duration::ZERO),
        Declaration::new("sink", sink_options),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();

    plan.stop_producing();
    plan.finished().await.unwrap();
    let err = plan.start_producing().unwrap_err();
    assert!(matches!(err, RivuletError::InvalidState(_)));
}

#[tokio::test]
async fn test_dropping_reader_stops_plan() {
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    let (sink_options, mut reader) = SinkNodeOptions::new();
    Declaration::sequence(vec![
        stream_source(1_000, Duration::from_millis(2)),
        Declaration::new("sink", sink_options),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();
    plan.start_producing().unwrap();

    assert!(reader.next().await.unwrap().is_some());
    drop(reader);
    tokio::time::timeout(Duration::from_secs(5), plan.finished())
        .await
        .expect("plan did not finish after reader was dropped")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_execution() {
    let cancel = CancellationHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = LocalExecutor::new()
        .execute_with_cancellation(stream_source(10_000, Duration::from_millis(5)), Some(cancel))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_filter_error_reaches_reader_once() {
    let functions = FunctionRegistry::with_builtins();
    functions
        .register_udf("checked", DataType::Boolean, |args: &[ArrayRef]| {
            let ids = args[0].as_any().downcast_ref::<Int64Array>().unwrap();
            if ids.values().iter().any(|&id| id >= 500) {
                return Err(RivuletError::execution("id out of range"));
            }
            Ok(Arc::new(BooleanArray::from(vec![true; ids.len()])) as ArrayRef)
        })
        .unwrap();
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx.with_functions(Arc::new(functions)));
    let (sink_options, mut reader) = SinkNodeOptions::new();
    Declaration::sequence(vec![
        Declaration::new(
            "table_source",
            TableSourceNodeOptions::new(id_schema(), id_batches(100, 10)),
        ),
        Declaration::new("filter", FilterNodeOptions::new(call("checked", vec![col("id")]))),
        Declaration::new("sink", sink_options),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();
    plan.start_producing().unwrap();

    let mut delivered = 0;
    let err = loop {
        match reader.next().await {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => panic!("stream ended without the filter error"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, RivuletError::ExecutionError(_)));
    assert!(delivered <= 50);
    assert!(reader.next().await.unwrap().is_none());

    let finished = plan.finished().await.unwrap_err();
    assert!(matches!(finished, RivuletError::ExecutionError(_)));
}

#[tokio::test]
async fn test_source_error_fails_execution() {
    let declaration = Declaration::new(
        "source",
        SourceNodeOptions::new(
            id_schema(),
            failing_stream(id_batches(2, 10), RivuletError::execution("disk on fire")),
        ),
    );
    let err = LocalExecutor::new().execute(declaration).await.unwrap_err();
    assert_eq!(err.to_string(), RivuletError::execution("disk on fire").to_string());
}

/// A source whose start always fails.
#[derive(Debug)]
struct BrokenSource {
    core: NodeCore,
}

impl ExecNode for BrokenSource {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn start_producing(self: Arc<Self>) -> RivuletResult<()> {
        Err(RivuletError::execution("cannot open input"))
    }

    fn input_received(self: Arc<Self>, _input: NodeId, _batch: ExecBatch) {}

    fn input_finished(self: Arc<Self>, _input: NodeId, _total: u64) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_failure_stops_started_nodes() {
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    let (healthy_sink, _healthy_reader) = SinkNodeOptions::new();
    Declaration::sequence(vec![
        stream_source(10_000, Duration::from_millis(5)),
        Declaration::new("sink", healthy_sink),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();

    let broken = plan
        .add_node(NodeSpec::new("broken", vec![], id_schema()), |core| {
            Ok(BrokenSource { core })
        })
        .unwrap();
    let (broken_sink, _broken_reader) = SinkNodeOptions::new();
    Declaration::new("sink", broken_sink)
        .with_inputs(vec![Declaration::live(broken)])
        .add_to_plan(&plan)
        .unwrap();

    let err = plan.start_producing().unwrap_err();
    assert!(matches!(err, RivuletError::ExecutionError(_)));
    let finished = tokio::time::timeout(Duration::from_secs(5), plan.finished())
        .await
        .expect("plan did not finish after a failed start")
        .unwrap_err();
    assert_eq!(finished.to_string(), err.to_string());
    assert_eq!(
        plan.node(NodeId::new(0)).unwrap().core().state(),
        NodeState::Stopped
    );
}

#[tokio::test]
async fn test_plan_validation() {
    let (ctx, _) = context();
    let empty = ExecPlan::new(ctx.clone());
    assert!(matches!(
        empty.start_producing().unwrap_err(),
        RivuletError::InvalidState(_)
    ));

    // a source without a consumer
    let dangling = ExecPlan::new(ctx.clone());
    stream_source(1, Duration::ZERO).add_to_plan(&dangling).unwrap();
    assert!(dangling.start_producing().is_err());

    // one producer cannot feed two consumers
    let plan = ExecPlan::new(ctx);
    let source = stream_source(1, Duration::ZERO).add_to_plan(&plan).unwrap();
    let (first, _r1) = SinkNodeOptions::new();
    let (second, _r2) = SinkNodeOptions::new();
    plan.make_node("sink", vec![source], Box::new(first)).unwrap();
    let err = plan
        .make_node("sink", vec![source], Box::new(second))
        .unwrap_err();
    assert!(matches!(err, RivuletError::InvalidOptions(_)));
}

// =============================================================================
// Consuming sink
// =============================================================================

#[derive(Default)]
struct CountingConsumer {
    rows: AtomicUsize,
    initialized: AtomicBool,
    finished: AtomicBool,
}

#[async_trait]
impl SinkConsumer for CountingConsumer {
    fn init(&self, schema: &SchemaRef, _backpressure: BackpressureControl) -> RivuletResult<()> {
        assert_eq!(schema.fields().len(), 1);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn consume(&self, batch: ExecBatch) -> RivuletResult<()> {
        self.rows.fetch_add(batch.num_rows(), Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self) -> RivuletResult<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_consuming_sink_waits_for_finish() {
    let consumer = Arc::new(CountingConsumer::default());
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    Declaration::sequence(vec![
        Declaration::new(
            "table_source",
            TableSourceNodeOptions::new(id_schema(), id_batches(4, 25)),
        ),
        Declaration::new(
            "consuming_sink",
            ConsumingSinkNodeOptions::new(consumer.clone()),
        ),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();
    assert!(consumer.initialized.load(Ordering::SeqCst));

    plan.start_producing().unwrap();
    plan.finished().await.unwrap();
    assert!(consumer.finished.load(Ordering::SeqCst));
    assert_eq!(consumer.rows.load(Ordering::SeqCst), 100);
}

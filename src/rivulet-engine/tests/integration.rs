//! Integration tests for the rivulet-engine crate.
//!
//! These tests run complete plans through [`LocalExecutor`] or a hand-built
//! [`ExecPlan`] and check the rows that reach the sink:
//!
//! 1. **Pipelines**: sources, filters and projections
//! 2. **Aggregation**: grouped, scalar and quantile aggregates
//! 3. **Joins**: every join type, null keys and residual filters
//! 4. **Sorting sinks**: order-by and top-k

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use common_config::RivuletConfig;
use common_error::RivuletError;
use rivulet_engine::expr::{call, col, lit};
use rivulet_engine::functions::{AggregateOptions, Interpolation};
use rivulet_engine::operators::{
    Aggregate, AggregateNodeOptions, FilterNodeOptions, HashJoinNodeOptions, JoinKeyCmp,
    JoinType, OrderByNodeOptions, ProjectNodeOptions, SelectKNodeOptions, SortKey,
    SourceNodeOptions, TableSourceNodeOptions,
};
use rivulet_engine::{Declaration, ExecPlan, ExecutionResult, FunctionRegistry, LocalExecutor};

use common::*;

fn employees_source() -> Declaration {
    Declaration::new(
        "table_source",
        TableSourceNodeOptions::new(employees_schema(), vec![employees()]),
    )
}

fn departments_source() -> Declaration {
    Declaration::new(
        "table_source",
        TableSourceNodeOptions::new(departments_schema(), vec![departments()]),
    )
}

async fn join(options: HashJoinNodeOptions) -> RecordBatch {
    let declaration = Declaration::new("hashjoin", options)
        .with_inputs(vec![employees_source(), departments_source()]);
    let result = LocalExecutor::new().execute(declaration).await.unwrap();
    result.concat().unwrap()
}

fn on_dept(join_type: JoinType) -> HashJoinNodeOptions {
    HashJoinNodeOptions::new(join_type, vec!["dept_id".into()], vec!["dept_id".into()])
}

fn sorted<T: Ord>(mut values: Vec<T>) -> Vec<T> {
    values.sort();
    values
}

fn names(batch: &RecordBatch, column: &str) -> Vec<Option<String>> {
    sorted(string_column(batch, column))
}

// =============================================================================
// Pipelines
// =============================================================================

#[tokio::test]
async fn test_filter_project_pipeline() {
    let declaration = Declaration::sequence(vec![
        employees_source(),
        Declaration::new("filter", FilterNodeOptions::new(col("salary").gt(lit(85.0)))),
        Declaration::new(
            "project",
            ProjectNodeOptions::new(vec![col("name"), col("salary").mul(lit(2.0))])
                .with_names(vec!["name".into(), "double_salary".into()]),
        ),
    ])
    .unwrap();

    let result = LocalExecutor::new().execute(declaration).await.unwrap();
    assert_eq!(result.total_rows(), 4);
    assert_eq!(result.schema().field(1).name(), "double_salary");

    let batch = result.concat().unwrap();
    assert_eq!(
        names(&batch, "name"),
        vec![
            Some("Alice".to_string()),
            Some("Bob".to_string()),
            Some("Carol".to_string()),
            Some("Dave".to_string())
        ]
    );
    let mut doubled: Vec<f64> = float64_column(&batch, "double_salary")
        .into_iter()
        .flatten()
        .collect();
    doubled.sort_by(f64::total_cmp);
    assert_eq!(doubled, vec![160.0, 180.0, 200.0, 240.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sink_restores_source_order() {
    let declaration = Declaration::sequence(vec![
        Declaration::new(
            "table_source",
            TableSourceNodeOptions::new(id_schema(), id_batches(1, 5000)).with_max_batch_size(64),
        ),
        Declaration::new("filter", FilterNodeOptions::new(col("id").gt_eq(lit(0i64)))),
    ])
    .unwrap();

    let result = LocalExecutor::new().execute(declaration).await.unwrap();
    assert_eq!(result.num_batches(), 79);
    let ids: Vec<i64> = result
        .iter()
        .flat_map(|b| int64_column(b, "id"))
        .flatten()
        .collect();
    assert_eq!(ids, (0..5000).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_source_from_stream() {
    let declaration = Declaration::new(
        "source",
        SourceNodeOptions::new(
            id_schema(),
            delayed_stream(id_batches(3, 10), std::time::Duration::from_millis(5)),
        ),
    );
    let result = LocalExecutor::with_batch_size(16).execute(declaration).await.unwrap();
    assert_eq!(result.total_rows(), 30);
    assert!(result.explain_analyze().contains("source#0"));
}

#[tokio::test]
async fn test_filter_with_udf() {
    let functions = FunctionRegistry::with_builtins();
    functions
        .register_udf("is_even", DataType::Boolean, |args: &[ArrayRef]| {
            let ids = args[0].as_any().downcast_ref::<Int64Array>().unwrap();
            let mask: BooleanArray = ids.iter().map(|v| v.map(|v| v % 2 == 0)).collect();
            Ok(Arc::new(mask) as ArrayRef)
        })
        .unwrap();
    let (ctx, _) = context();
    let ctx = ctx.with_functions(Arc::new(functions));

    let declaration = Declaration::sequence(vec![
        Declaration::new(
            "table_source",
            TableSourceNodeOptions::new(id_schema(), id_batches(2, 10)),
        ),
        Declaration::new("filter", FilterNodeOptions::new(call("is_even", vec![col("id")]))),
    ])
    .unwrap();
    let result = LocalExecutor::new().execute_in(ctx, declaration, None).await.unwrap();
    assert_eq!(result.total_rows(), 10);
}

#[tokio::test]
async fn test_construction_errors_surface_before_start() {
    let unknown = Declaration::sequence(vec![
        employees_source(),
        Declaration::new("filter", FilterNodeOptions::new(col("missing").gt(lit(1i64)))),
    ])
    .unwrap();
    let err = LocalExecutor::new().execute(unknown).await.unwrap_err();
    assert!(err.is_construction_error());

    let not_boolean = Declaration::sequence(vec![
        employees_source(),
        Declaration::new("filter", FilterNodeOptions::new(col("salary"))),
    ])
    .unwrap();
    let err = LocalExecutor::new().execute(not_boolean).await.unwrap_err();
    assert!(matches!(err, RivuletError::TypeError(_)));

    let wrong_options = Declaration::sequence(vec![
        employees_source(),
        Declaration::new("filter", ProjectNodeOptions::new(vec![col("name")])),
    ])
    .unwrap();
    let err = LocalExecutor::new().execute(wrong_options).await.unwrap_err();
    assert!(matches!(err, RivuletError::InvalidOptions(_)));

    let no_factory = Declaration::new("teleport", FilterNodeOptions::new(lit(true)));
    let err = LocalExecutor::new().execute(no_factory).await.unwrap_err();
    assert!(matches!(err, RivuletError::NotFound(_)));
}

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn test_grouped_aggregate() {
    let declaration = Declaration::sequence(vec![
        employees_source(),
        Declaration::new(
            "aggregate",
            AggregateNodeOptions::new(
                vec!["dept_id".into()],
                vec![
                    Aggregate::count_all("employees"),
                    Aggregate::new("sum", "salary", "total"),
                    Aggregate::new("max", "emp_id", "last_id"),
                ],
            ),
        ),
    ])
    .unwrap();

    let result = LocalExecutor::new().execute(declaration).await.unwrap();
    let fields: Vec<&str> = result
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect();
    assert_eq!(fields, vec!["dept_id", "employees", "total", "last_id"]);

    let batch = result.concat().unwrap();
    assert_eq!(batch.num_rows(), 5);
    let groups: HashMap<Option<i64>, (Option<i64>, Option<f64>, Option<i64>)> =
        int64_column(&batch, "dept_id")
            .into_iter()
            .zip(int64_column(&batch, "employees"))
            .zip(float64_column(&batch, "total"))
            .zip(int64_column(&batch, "last_id"))
            .map(|(((k, c), t), l)| (k, (c, t, l)))
            .collect();
    assert_eq!(groups[&Some(10)], (Some(2), Some(220.0), Some(3)));
    assert_eq!(groups[&Some(20)], (Some(1), Some(80.0), Some(2)));
    assert_eq!(groups[&None], (Some(1), Some(60.0), Some(6)));
}

#[tokio::test]
async fn test_scalar_aggregate_over_empty_input() {
    let declaration = Declaration::sequence(vec![
        Declaration::new(
            "table_source",
            TableSourceNodeOptions::new(id_schema(), vec![]),
        ),
        Declaration::new(
            "aggregate",
            AggregateNodeOptions::new(
                vec![],
                vec![Aggregate::count_all("n"), Aggregate::new("sum", "id", "total")],
            ),
        ),
    ])
    .unwrap();

    let result = LocalExecutor::new().execute(declaration).await.unwrap();
    let batch = result.concat().unwrap();
    assert_eq!(int64_column(&batch, "n"), vec![Some(0)]);
    assert_eq!(int64_column(&batch, "total"), vec![None]);
}

#[tokio::test]
async fn test_quantile_interpolation() {
    let run = |interpolation| async move {
        let declaration = Declaration::sequence(vec![
            Declaration::new(
                "table_source",
                TableSourceNodeOptions::new(id_schema(), id_batches(1, 4)),
            ),
            Declaration::new(
                "aggregate",
                AggregateNodeOptions::new(
                    vec![],
                    vec![
                        Aggregate::new("quantile", "id", "median").with_options(
                            AggregateOptions::Quantile {
                                q: 0.5,
                                interpolation,
                            },
                        ),
                    ],
                ),
            ),
        ])
        .unwrap();
        let result = LocalExecutor::new().execute(declaration).await.unwrap();
        float64_column(&result.concat().unwrap(), "median")[0]
    };

    // samples 0, 1, 2, 3: the median falls halfway between 1 and 2
    assert_eq!(run(Interpolation::Linear).await, Some(1.5));
    assert_eq!(run(Interpolation::Lower).await, Some(1.0));
    assert_eq!(run(Interpolation::Higher).await, Some(2.0));
    assert_eq!(run(Interpolation::Nearest).await, Some(2.0));
    assert_eq!(run(Interpolation::Midpoint).await, Some(1.5));
}

#[tokio::test]
async fn test_aggregate_rejects_unknown_function() {
    let declaration = Declaration::sequence(vec![
        employees_source(),
        Declaration::new(
            "aggregate",
            AggregateNodeOptions::new(vec![], vec![Aggregate::new("mode", "salary", "m")]),
        ),
    ])
    .unwrap();
    let err = LocalExecutor::new().execute(declaration).await.unwrap_err();
    assert!(matches!(err, RivuletError::NotFound(_)));
}

// =============================================================================
// Joins
// =============================================================================

#[tokio::test]
async fn test_inner_join() {
    let batch = join(on_dept(JoinType::Inner)).await;
    let fields: Vec<String> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(
        fields,
        vec!["emp_id", "name", "dept_id_l", "salary", "dept_id_r", "dept_name"]
    );

    let pairs: Vec<(Option<String>, Option<String>)> = sorted(
        string_column(&batch, "name")
            .into_iter()
            .zip(string_column(&batch, "dept_name"))
            .collect(),
    );
    let expected = [("Alice", "Eng"), ("Bob", "Sales"), ("Carol", "Eng"), ("Dave", "Ops")];
    assert_eq!(
        pairs,
        expected
            .iter()
            .map(|(n, d)| (Some(n.to_string()), Some(d.to_string())))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_outer_joins_fill_nulls() {
    let left = join(on_dept(JoinType::LeftOuter)).await;
    assert_eq!(left.num_rows(), 6);
    let unmatched: Vec<Option<String>> = string_column(&left, "name")
        .into_iter()
        .zip(string_column(&left, "dept_name"))
        .filter(|(_, dept)| dept.is_none())
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        sorted(unmatched),
        vec![Some("Eve".to_string()), Some("Frank".to_string())]
    );

    let right = join(on_dept(JoinType::RightOuter)).await;
    assert_eq!(right.num_rows(), 6);
    assert_eq!(
        string_column(&right, "name")
            .iter()
            .filter(|n| n.is_none())
            .count(),
        2
    );

    let full = join(on_dept(JoinType::FullOuter)).await;
    assert_eq!(full.num_rows(), 8);
    assert!(full.schema().field(0).is_nullable());
}

/// Two-column table of `(k, <value_name>)` rows.
fn keyed_source(rows: &[(i64, &str)], value_name: &str) -> Declaration {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new(value_name, DataType::Utf8, false),
    ]));
    let keys: Vec<i64> = rows.iter().map(|(k, _)| *k).collect();
    let values: Vec<&str> = rows.iter().map(|(_, v)| *v).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(StringArray::from(values)),
        ],
    )
    .unwrap();
    Declaration::new("table_source", TableSourceNodeOptions::new(schema, vec![batch]))
}

type KeyedRow = (Option<i64>, Option<String>, Option<String>);

async fn keyed_join(join_type: JoinType) -> Vec<KeyedRow> {
    let options = HashJoinNodeOptions::new(join_type, vec!["k".into()], vec!["k".into()])
        .with_left_output(vec!["k".into(), "lv".into()])
        .with_right_output(vec!["rv".into()]);
    let declaration = Declaration::new("hashjoin", options).with_inputs(vec![
        keyed_source(&[(1, "a"), (2, "b")], "lv"),
        keyed_source(&[(2, "x"), (3, "y")], "rv"),
    ]);
    let batch = LocalExecutor::new()
        .execute(declaration)
        .await
        .unwrap()
        .concat()
        .unwrap();
    let keys = int64_column(&batch, "k");
    let left = string_column(&batch, "lv");
    let right = string_column(&batch, "rv");
    sorted(
        keys.into_iter()
            .zip(left)
            .zip(right)
            .map(|((k, l), r)| (k, l, r))
            .collect(),
    )
}

#[tokio::test]
async fn test_inner_and_full_outer_rows() {
    let b = || Some("b".to_string());
    let x = || Some("x".to_string());
    assert_eq!(keyed_join(JoinType::Inner).await, vec![(Some(2), b(), x())]);

    assert_eq!(
        keyed_join(JoinType::FullOuter).await,
        vec![
            (None, None, Some("y".to_string())),
            (Some(1), Some("a".to_string()), None),
            (Some(2), b(), x()),
        ]
    );
}

#[tokio::test]
async fn test_semi_and_anti_joins() {
    let left_semi = join(on_dept(JoinType::LeftSemi)).await;
    assert_eq!(left_semi.num_columns(), 4);
    assert_eq!(
        names(&left_semi, "name"),
        vec![
            Some("Alice".to_string()),
            Some("Bob".to_string()),
            Some("Carol".to_string()),
            Some("Dave".to_string())
        ]
    );

    let left_anti = join(on_dept(JoinType::LeftAnti)).await;
    assert_eq!(
        names(&left_anti, "name"),
        vec![Some("Eve".to_string()), Some("Frank".to_string())]
    );

    let right_semi = join(on_dept(JoinType::RightSemi)).await;
    assert_eq!(
        names(&right_semi, "dept_name"),
        vec![
            Some("Eng".to_string()),
            Some("Ops".to_string()),
            Some("Sales".to_string())
        ]
    );

    let right_anti = join(on_dept(JoinType::RightAnti)).await;
    assert_eq!(
        names(&right_anti, "dept_name"),
        vec![Some("Legal".to_string()), Some("Unknown".to_string())]
    );
}

#[tokio::test]
async fn test_null_keys_match_with_is_comparison() {
    let batch = join(on_dept(JoinType::Inner).with_key_cmp(vec![JoinKeyCmp::Is])).await;
    assert_eq!(batch.num_rows(), 5);
    let frank: Vec<Option<String>> = string_column(&batch, "name")
        .into_iter()
        .zip(string_column(&batch, "dept_name"))
        .filter(|(name, _)| name.as_deref() == Some("Frank"))
        .map(|(_, dept)| dept)
        .collect();
    assert_eq!(frank, vec![Some("Unknown".to_string())]);
}

#[tokio::test]
async fn test_join_residual_filter() {
    let inner = join(on_dept(JoinType::Inner).with_filter(col("salary").gt(lit(85.0)))).await;
    assert_eq!(
        names(&inner, "name"),
        vec![
            Some("Alice".to_string()),
            Some("Carol".to_string()),
            Some("Dave".to_string())
        ]
    );

    // Bob's only candidate fails the filter, so he is null-extended
    let left = join(on_dept(JoinType::LeftOuter).with_filter(col("salary").gt(lit(85.0)))).await;
    assert_eq!(left.num_rows(), 6);
    let bob: Vec<Option<String>> = string_column(&left, "name")
        .into_iter()
        .zip(string_column(&left, "dept_name"))
        .filter(|(name, _)| name.as_deref() == Some("Bob"))
        .map(|(_, dept)| dept)
        .collect();
    assert_eq!(bob, vec![None]);
}

#[tokio::test]
async fn test_join_output_selection_and_explain() {
    let options = on_dept(JoinType::Inner)
        .with_left_output(vec!["name".into()])
        .with_right_output(vec!["dept_name".into()]);
    let batch = join(options.clone()).await;
    assert_eq!(batch.num_columns(), 2);
    assert_eq!(batch.num_rows(), 4);

    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    let (sink_options, _reader) = rivulet_engine::operators::SinkNodeOptions::new();
    Declaration::new("sink", sink_options)
        .with_inputs(vec![
            Declaration::new("hashjoin", options)
                .with_inputs(vec![employees_source(), departments_source()]),
        ])
        .add_to_plan(&plan)
        .unwrap();
    let explain = plan.explain();
    assert!(explain.contains("hashjoin#2"));
    assert!(explain.contains("inner: dept_id = dept_id"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_probe_arriving_during_build() {
    // slow build side, fast probe side: probe batches queue behind the build
    let left = Declaration::new(
        "source",
        SourceNodeOptions::new(
            id_schema(),
            delayed_stream(id_batches(5, 20), std::time::Duration::from_millis(10)),
        ),
    );
    let right = Declaration::new(
        "table_source",
        TableSourceNodeOptions::new(id_schema(), id_batches(1, 100)).with_max_batch_size(7),
    );
    let declaration = Declaration::new(
        "hashjoin",
        HashJoinNodeOptions::new(JoinType::Inner, vec!["id".into()], vec!["id".into()]),
    )
    .with_inputs(vec![left, right]);

    let result = LocalExecutor::new().execute(declaration).await.unwrap();
    assert_eq!(result.total_rows(), 100);
}

#[tokio::test]
async fn test_join_exceeding_memory_limit_fails() {
    let mut config = RivuletConfig::default();
    config.execution.memory_limit = Some(64);
    let declaration = Declaration::new("hashjoin", on_dept(JoinType::Inner))
        .with_inputs(vec![employees_source(), departments_source()]);

    let err = LocalExecutor::with_config(config)
        .execute(declaration)
        .await
        .unwrap_err();
    assert!(err.is_resource_exhausted());
}

// =============================================================================
// Sorting sinks
// =============================================================================

/// Run employees into `sink` and wait for the plan.
async fn run_sorting_sink(sink: Declaration) {
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    Declaration::sequence(vec![employees_source(), sink])
        .unwrap()
        .add_to_plan(&plan)
        .unwrap();
    plan.start_producing().unwrap();
    plan.finished().await.unwrap();
}

#[tokio::test]
async fn test_order_by_sink() {
    let (options, reader) = OrderByNodeOptions::new(vec![SortKey::asc("salary")]);
    run_sorting_sink(Declaration::new("order_by_sink", options)).await;
    let batches = reader.collect_record_batches().await.unwrap();
    let batch = concat(&employees_schema(), &batches);
    assert_eq!(
        float64_column(&batch, "salary"),
        [60.0, 70.0, 80.0, 90.0, 100.0, 120.0].map(Some).to_vec()
    );
}

#[tokio::test]
async fn test_select_k_sink() {
    let (options, reader) = SelectKNodeOptions::new(3, vec![SortKey::desc("salary")]);
    run_sorting_sink(Declaration::new("select_k_sink", options)).await;
    let batches = reader.collect_record_batches().await.unwrap();
    let batch = concat(&employees_schema(), &batches);
    assert_eq!(
        string_column(&batch, "name"),
        vec![
            Some("Carol".to_string()),
            Some("Alice".to_string()),
            Some("Dave".to_string())
        ]
    );
}

#[tokio::test]
async fn test_select_k_larger_than_input() {
    let (options, reader) = SelectKNodeOptions::new(50, vec![SortKey::asc("emp_id")]);
    run_sorting_sink(Declaration::new("select_k_sink", options)).await;
    let batches = reader.collect_record_batches().await.unwrap();
    assert_eq!(concat(&employees_schema(), &batches).num_rows(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_select_k_matches_full_sort_on_random_input() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(7);
    let values: Vec<i64> = (0..2000).map(|_| rng.gen_range(-500..500)).collect();
    let batches: Vec<RecordBatch> = values
        .chunks(64)
        .map(|chunk| {
            RecordBatch::try_new(id_schema(), vec![Arc::new(Int64Array::from(chunk.to_vec()))])
                .unwrap()
        })
        .collect();

    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    let (options, reader) = SelectKNodeOptions::new(25, vec![SortKey::desc("id")]);
    Declaration::sequence(vec![
        Declaration::new("table_source", TableSourceNodeOptions::new(id_schema(), batches)),
        Declaration::new("select_k_sink", options),
    ])
    .unwrap()
    .add_to_plan(&plan)
    .unwrap();
    plan.start_producing().unwrap();
    let output = concat(&id_schema(), &reader.collect_record_batches().await.unwrap());
    plan.finished().await.unwrap();

    let mut expected = values;
    expected.sort_unstable_by(|a, b| b.cmp(a));
    expected.truncate(25);
    let actual: Vec<i64> = int64_column(&output, "id").into_iter().flatten().collect();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn test_select_k_rejects_zero() {
    let (ctx, _) = context();
    let plan = ExecPlan::new(ctx);
    let (options, _reader) = SelectKNodeOptions::new(0, vec![SortKey::asc("emp_id")]);
    let err = Declaration::sequence(vec![employees_source(), Declaration::new("select_k_sink", options)])
        .unwrap()
        .add_to_plan(&plan)
        .unwrap_err();
    assert!(matches!(err, RivuletError::InvalidOptions(_)));
}

#[test]
fn test_execute_sync_outside_runtime() {
    let declaration = Declaration::new(
        "table_source",
        TableSourceNodeOptions::new(employees_schema(), vec![employees()]),
    );
    let result: ExecutionResult = LocalExecutor::new().execute_sync(declaration).unwrap();
    assert_eq!(result.total_rows(), 6);
}

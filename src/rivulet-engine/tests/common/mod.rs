//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use futures::StreamExt;
use futures::stream::BoxStream;

use common_error::RivuletResult;
use rivulet_engine::{ExecBatch, ExecContext, MetricsSink};

/// Context on the current runtime with a metrics table the test can read.
pub fn context() -> (ExecContext, MetricsSink) {
    let metrics = MetricsSink::new();
    let ctx = ExecContext::for_current_runtime()
        .unwrap()
        .with_metrics(metrics.clone());
    (ctx, metrics)
}

pub fn id_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]))
}

/// `n` single-column batches of `rows` consecutive ids each.
pub fn id_batches(n: usize, rows: usize) -> Vec<RecordBatch> {
    (0..n)
        .map(|b| {
            let start = (b * rows) as i64;
            let ids: Vec<i64> = (start..start + rows as i64).collect();
            RecordBatch::try_new(id_schema(), vec![Arc::new(Int64Array::from(ids))]).unwrap()
        })
        .collect()
}

/// Yields `batches` with a pause before each one.
pub fn delayed_stream(
    batches: Vec<RecordBatch>,
    delay: Duration,
) -> BoxStream<'static, RivuletResult<ExecBatch>> {
    futures::stream::iter(batches)
        .then(move |batch| async move {
            tokio::time::sleep(delay).await;
            Ok(ExecBatch::from_record_batch(&batch))
        })
        .boxed()
}

/// Yields `batches` then fails with `error`.
pub fn failing_stream(
    batches: Vec<RecordBatch>,
    error: common_error::RivuletError,
) -> BoxStream<'static, RivuletResult<ExecBatch>> {
    let items: Vec<RivuletResult<ExecBatch>> = batches
        .iter()
        .map(|b| Ok(ExecBatch::from_record_batch(b)))
        .chain(std::iter::once(Err(error)))
        .collect();
    futures::stream::iter(items).boxed()
}

pub fn employees_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("emp_id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("dept_id", DataType::Int64, true),
        Field::new("salary", DataType::Float64, false),
    ]))
}

/// Six employees; Frank has no department and Eve's department does not exist.
pub fn employees() -> RecordBatch {
    RecordBatch::try_new(
        employees_schema(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5, 6])),
            Arc::new(StringArray::from(vec![
                "Alice", "Bob", "Carol", "Dave", "Eve", "Frank",
            ])),
            Arc::new(Int64Array::from(vec![
                Some(10),
                Some(20),
                Some(10),
                Some(30),
                Some(99),
                None,
            ])),
            Arc::new(Float64Array::from(vec![
                100.0, 80.0, 120.0, 90.0, 70.0, 60.0,
            ])),
        ],
    )
    .unwrap()
}

pub fn departments_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("dept_id", DataType::Int64, true),
        Field::new("dept_name", DataType::Utf8, false),
    ]))
}

/// Four departments; Legal has no employees and one row has a null id.
pub fn departments() -> RecordBatch {
    RecordBatch::try_new(
        departments_schema(),
        vec![
            Arc::new(Int64Array::from(vec![Some(10), Some(20), Some(30), Some(40), None])),
            Arc::new(StringArray::from(vec![
                "Eng", "Sales", "Ops", "Legal", "Unknown",
            ])),
        ],
    )
    .unwrap()
}

pub fn int64_column(batch: &RecordBatch, name: &str) -> Vec<Option<i64>> {
    let column = batch.column_by_name(name).unwrap();
    let array = column.as_any().downcast_ref::<Int64Array>().unwrap();
    (0..array.len())
        .map(|i| array.is_valid(i).then(|| array.value(i)))
        .collect()
}

pub fn float64_column(batch: &RecordBatch, name: &str) -> Vec<Option<f64>> {
    let column = batch.column_by_name(name).unwrap();
    let array = column.as_any().downcast_ref::<Float64Array>().unwrap();
    (0..array.len())
        .map(|i| array.is_valid(i).then(|| array.value(i)))
        .collect()
}

pub fn string_column(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
    let column = batch.column_by_name(name).unwrap();
    let array = column.as_any().downcast_ref::<StringArray>().unwrap();
    (0..array.len())
        .map(|i| array.is_valid(i).then(|| array.value(i).to_string()))
        .collect()
}

/// Concatenate `batches` under `schema`, tolerating an empty list.
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> RecordBatch {
    arrow::compute::concat_batches(schema, batches).unwrap()
}

//! Query execution result types.

use std::fmt::Write;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use common_error::RivuletResult;

use crate::metrics::MetricsSink;

/// Everything a sink delivered, plus how the run went.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Output batches in delivery order.
    pub batches: Vec<RecordBatch>,
    pub schema: SchemaRef,
    pub metrics: MetricsSink,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub const fn new(
        batches: Vec<RecordBatch>,
        schema: SchemaRef,
        metrics: MetricsSink,
        elapsed: Duration,
    ) -> Self {
        Self {
            batches,
            schema,
            metrics,
            elapsed,
        }
    }

    pub fn total_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub const fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows() == 0
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordBatch> {
        self.batches.iter()
    }

    /// All batches as one.
    pub fn concat(&self) -> RivuletResult<RecordBatch> {
        if self.batches.is_empty() {
            return Ok(RecordBatch::new_empty(self.schema.clone()));
        }
        Ok(arrow::compute::concat_batches(&self.schema, &self.batches)?)
    }

    /// Format as EXPLAIN ANALYZE output.
    pub fn explain_analyze(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "Execution Time: {:?}", self.elapsed);
        let _ = writeln!(output, "Total Rows: {}", self.total_rows());
        let _ = writeln!(output, "Batches: {}", self.num_batches());
        output.push_str("\nNode Metrics:\n");
        output.push_str(&common_display::indent(&self.metrics.format_analyze(), "  "));
        output.push('\n');
        output
    }

    /// Rows per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total_rows() as f64 / secs
        }
    }
}

impl IntoIterator for ExecutionResult {
    type Item = RecordBatch;
    type IntoIter = std::vec::IntoIter<RecordBatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.into_iter()
    }
}

//! Per-node execution metrics.
//!
//! Nodes report into a shared [`MetricsSink`] keyed by node label. The sink
//! is owned by the execution context, so every plan built from one context
//! reports into the same table.

use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Counters for a single node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetrics {
    pub rows_in: u64,
    pub rows_out: u64,
    pub batches_in: u64,
    pub batches_out: u64,
    /// Time spent inside the node's tasks.
    pub exec_time: Duration,
    /// Peak reserved memory in bytes.
    pub peak_memory: usize,
    /// Pause requests the node sent upstream.
    pub pauses: u64,
}

impl NodeMetrics {
    pub fn record_input(&mut self, rows: usize) {
        self.rows_in += rows as u64;
        self.batches_in += 1;
    }

    pub fn record_output(&mut self, rows: usize) {
        self.rows_out += rows as u64;
        self.batches_out += 1;
    }

    pub fn add_time(&mut self, elapsed: Duration) {
        self.exec_time += elapsed;
    }

    pub fn update_memory(&mut self, bytes: usize) {
        self.peak_memory = self.peak_memory.max(bytes);
    }

    /// `rows_out / rows_in`, 1.0 when nothing came in.
    pub fn selectivity(&self) -> f64 {
        if self.rows_in == 0 {
            1.0
        } else {
            self.rows_out as f64 / self.rows_in as f64
        }
    }
}

impl fmt::Display for NodeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows_in={}, rows_out={}, batches_in={}, batches_out={}, time={:?}, memory={}B",
            self.rows_in,
            self.rows_out,
            self.batches_in,
            self.batches_out,
            self.exec_time,
            self.peak_memory
        )?;
        if self.pauses > 0 {
            write!(f, ", pauses={}", self.pauses)?;
        }
        Ok(())
    }
}

/// Shared table of node metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSink {
    metrics: Arc<RwLock<BTreeMap<String, NodeMetrics>>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to the entry for `node`, creating it if missing.
    pub fn update<F>(&self, node: &str, f: F)
    where
        F: FnOnce(&mut NodeMetrics),
    {
        let mut metrics = self.metrics.write();
        f(metrics.entry(node.to_string()).or_default());
    }

    pub fn get(&self, node: &str) -> Option<NodeMetrics> {
        self.metrics.read().get(node).cloned()
    }

    pub fn all(&self) -> BTreeMap<String, NodeMetrics> {
        self.metrics.read().clone()
    }

    pub fn clear(&self) {
        self.metrics.write().clear();
    }

    pub fn total_rows_out(&self) -> u64 {
        self.metrics.read().values().map(|m| m.rows_out).sum()
    }

    /// One line per node, for EXPLAIN ANALYZE output.
    pub fn format_analyze(&self) -> String {
        let metrics = self.metrics.read();
        if metrics.is_empty() {
            return "No metrics collected.\n".to_string();
        }
        let mut output = String::new();
        for (node, m) in metrics.iter() {
            let _ = writeln!(output, "{node}: {m}");
        }
        output
    }
}

/// Measures the wall time of one task.
#[derive(Debug)]
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

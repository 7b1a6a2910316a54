//! Configuration management for Rivulet.
//!
//! Provides the execution defaults shared by every plan: worker threads,
//! batch sizing, memory limits and the watermarks used for sink backpressure.

use common_error::{RivuletError, RivuletResult};
use serde::{Deserialize, Serialize};

/// Default number of rows per emitted batch.
pub const DEFAULT_BATCH_SIZE: usize = 32 * 1024;

/// Default sink backpressure watermarks (bytes).
pub const DEFAULT_BACKPRESSURE_LOW: u64 = 32 * 1024 * 1024;
pub const DEFAULT_BACKPRESSURE_HIGH: u64 = 64 * 1024 * 1024;

/// Global Rivulet configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RivuletConfig {
    /// Execution configuration.
    pub execution: ExecutionConfig,
    /// Default backpressure configuration for sinks.
    pub backpressure: BackpressureConfig,
}

impl RivuletConfig {
    /// Check cross-field invariants.
    pub fn validate(&self) -> RivuletResult<()> {
        self.execution.validate()?;
        self.backpressure.validate()
    }
}

/// Execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker threads of the task pool (`None` = one per core).
    pub worker_threads: Option<usize>,
    /// Maximum rows per batch emitted by pipeline breakers.
    pub batch_size: usize,
    /// Memory limit in bytes (`None` = unlimited).
    pub memory_limit: Option<usize>,
    /// Collect per-node metrics.
    pub collect_metrics: bool,
    /// Restore source order at sinks using batch indices.
    pub sequence_output: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            batch_size: DEFAULT_BATCH_SIZE,
            memory_limit: None,
            collect_metrics: true,
            sequence_output: true,
        }
    }
}

impl ExecutionConfig {
    /// Set worker thread count.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Set batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set memory limit.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Enable or disable metrics collection.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.collect_metrics = enabled;
        self
    }

    /// Enable or disable output sequencing at sinks.
    pub fn with_sequence_output(mut self, enabled: bool) -> Self {
        self.sequence_output = enabled;
        self
    }

    pub fn validate(&self) -> RivuletResult<()> {
        if self.batch_size == 0 {
            return Err(RivuletError::invalid_options("batch_size must be positive"));
        }
        if self.worker_threads == Some(0) {
            return Err(RivuletError::invalid_options(
                "worker_threads must be positive",
            ));
        }
        Ok(())
    }
}

/// Unit in which buffered data is measured for backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackpressureUnit {
    /// Buffer memory size in bytes.
    #[default]
    Bytes,
    /// Number of buffered rows.
    Rows,
    /// Number of buffered batches.
    Batches,
}

/// Watermarks for pausing and resuming a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Measurement unit for both watermarks.
    pub unit: BackpressureUnit,
    /// Resume the producer once buffered data drops to this level.
    pub low_watermark: u64,
    /// Pause the producer once buffered data exceeds this level.
    pub high_watermark: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            unit: BackpressureUnit::Bytes,
            low_watermark: DEFAULT_BACKPRESSURE_LOW,
            high_watermark: DEFAULT_BACKPRESSURE_HIGH,
        }
    }
}

impl BackpressureConfig {
    /// Create a watermark pair in the given unit.
    pub fn new(unit: BackpressureUnit, low_watermark: u64, high_watermark: u64) -> Self {
        Self {
            unit,
            low_watermark,
            high_watermark,
        }
    }

    pub fn validate(&self) -> RivuletResult<()> {
        if self.low_watermark >= self.high_watermark {
            return Err(RivuletError::invalid_options(format!(
                "backpressure low watermark ({}) must be below high watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

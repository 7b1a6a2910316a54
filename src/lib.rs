//! Rivulet - push-based streaming execution engine
//!
//! Rivulet runs DAGs of relational operators (sources, filters, projections,
//! aggregates, hash joins, order-by and top-k sinks) over Arrow record
//! batches, with backpressure-aware scheduling on a shared task pool.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

// Re-export core crates
pub use common_config as config;
pub use common_error as error;
pub use common_runtime as runtime;
pub use rivulet_engine as engine;

/// Rivulet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
